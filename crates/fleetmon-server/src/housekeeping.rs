use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};

use fleetmon_alert::RuleCover;
use fleetmon_storage::store::transfer::NewTransfer;

use crate::error::Result;
use crate::scheduler::job;
use crate::state::AppState;

/// The most recent top-of-hour in the dashboard's timezone; hourly transfer
/// points share this timestamp so per-hour aggregation lines up.
pub fn hour_start(tz: chrono_tz::Tz) -> DateTime<Utc> {
    let now = Utc::now().with_timezone(&tz);
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Snapshots every agent's traffic counters into one transfer row per agent
/// with non-zero usage. Also invoked on shutdown so no partial hour is lost.
pub async fn record_transfer_hourly_usage(state: &AppState) {
    let recorded_at = hour_start(state.scheduler.timezone());
    let mut rows = Vec::new();
    state.registry.range(|agent| {
        if let Some((tx_in, tx_out)) = agent.take_transfer_delta() {
            rows.push(NewTransfer {
                server_id: agent.id,
                transfer_in: tx_in,
                transfer_out: tx_out,
                recorded_at,
            });
        }
        true
    });

    if rows.is_empty() {
        return;
    }
    match state.store.insert_transfers(rows).await {
        Ok(count) => tracing::info!(rows = count, "saved traffic metrics"),
        Err(e) => tracing::error!(error = %e, "failed to save traffic metrics"),
    }
}

/// The daily retention pass over probe history and transfer rows. Transfer
/// retention is bounded by the earliest cycle start of any active
/// transfer-cycle rule: globally for all-covering rules, per server for
/// rules pinned to an ignore set.
pub async fn clean_history(state: &AppState) -> Result<()> {
    let now = Utc::now();
    state
        .store
        .prune_service_histories(now, &state.sentinel.service_ids())
        .await?;

    let mut all_keep: Option<DateTime<Utc>> = None;
    let mut special_keep: HashMap<u64, DateTime<Utc>> = HashMap::new();
    for alert in state.alerts.list() {
        if !alert.enabled {
            continue;
        }
        for rule in alert.rules.iter().filter(|r| r.is_transfer_cycle()) {
            let (cycle_start, _) = rule.cycle_period(now);
            match rule.cover {
                RuleCover::All => {
                    all_keep = Some(match all_keep {
                        Some(keep) => keep.min(cycle_start),
                        None => cycle_start,
                    });
                }
                RuleCover::IgnoreAll => {
                    for (server_id, pinned) in &rule.ignore {
                        if !pinned {
                            continue;
                        }
                        special_keep
                            .entry(*server_id)
                            .and_modify(|keep| *keep = (*keep).min(cycle_start))
                            .or_insert(cycle_start);
                    }
                }
            }
        }
    }

    let live_servers: Vec<u64> = state.registry.list().keys().copied().collect();
    let special: Vec<(u64, DateTime<Utc>)> = special_keep.into_iter().collect();
    state
        .store
        .prune_transfers(&live_servers, all_keep, &special)
        .await?;
    Ok(())
}

/// Registers the housekeeping cron jobs: the 03:30 retention pass and the
/// hourly transfer point.
pub fn register(state: &AppState) -> Result<()> {
    let cleanup_state = state.clone();
    state.scheduler.add_cron(
        "0 30 3 * * *",
        job(move || {
            let state = cleanup_state.clone();
            async move {
                if let Err(e) = clean_history(&state).await {
                    tracing::error!(error = %e, "history cleanup failed");
                }
            }
        }),
    )?;

    let hourly_state = state.clone();
    state.scheduler.add_cron(
        "0 0 * * * *",
        job(move || {
            let state = hourly_state.clone();
            async move {
                record_transfer_hourly_usage(&state).await;
            }
        }),
    )?;
    Ok(())
}
