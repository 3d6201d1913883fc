use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};

use fleetmon_common::util::ip_to_binary;

use crate::entities::waf;
use crate::{Result, Store, StorageError};

/// Why an address was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockReason {
    LoginFail = 1,
    BruteForceToken = 2,
    AgentAuthFail = 3,
    Manual = 4,
    BruteForceOauth2 = 5,
}

/// Reserved block identifiers; non-negative identifiers are user ids.
pub const BLOCK_ID_GRPC: i64 = -127;
pub const BLOCK_ID_TOKEN: i64 = -126;
pub const BLOCK_ID_UNKNOWN_USER: i64 = -125;
pub const BLOCK_ID_MANUAL: i64 = -124;

/// Manual blocks get a count high enough to never expire.
const MANUAL_BLOCK_COUNT: i64 = 99999;

/// Block predicate: blocked while `2^count + latest_ts` is still in the
/// future, saturating, with a floor of three seconds past the latest event.
pub fn is_blocked(total_count: u64, latest_ts: u64, now: u64) -> bool {
    let penalty = if total_count >= u64::BITS as u64 {
        u64::MAX
    } else {
        1u64 << total_count
    };
    let until = penalty
        .saturating_add(latest_ts)
        .max(latest_ts.saturating_add(3));
    until > now
}

impl Store {
    /// Upserts a block event; repeats bump the counter, manual blocks pin it
    /// to a terminal value.
    pub async fn block_ip(&self, ip: &str, reason: BlockReason, identifier: i64) -> Result<()> {
        if ip.is_empty() {
            return Ok(());
        }
        let key = ip_to_binary(ip).ok_or_else(|| StorageError::InvalidIp(ip.to_owned()))?;
        let now = Utc::now().timestamp();

        let txn = self.db.begin().await?;
        let existing = waf::Entity::find_by_id((key.to_vec(), identifier))
            .one(&txn)
            .await?;
        match existing {
            Some(row) => {
                let count = if reason == BlockReason::Manual {
                    MANUAL_BLOCK_COUNT
                } else {
                    row.count + 1
                };
                let mut active: waf::ActiveModel = row.into();
                active.block_reason = Set(reason as u8 as i32);
                active.block_timestamp = Set(now);
                active.count = Set(count);
                active.update(&txn).await?;
            }
            None => {
                let count = if reason == BlockReason::Manual {
                    MANUAL_BLOCK_COUNT
                } else {
                    1
                };
                waf::ActiveModel {
                    ip: Set(key.to_vec()),
                    block_identifier: Set(identifier),
                    block_reason: Set(reason as u8 as i32),
                    block_timestamp: Set(now),
                    count: Set(count),
                }
                .insert(&txn)
                .await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    /// Whether the address is currently blocked, summing counts across all
    /// identifiers and taking the most recent event timestamp.
    pub async fn check_ip(&self, ip: &str) -> Result<bool> {
        if ip.is_empty() {
            return Ok(false);
        }
        let key = ip_to_binary(ip).ok_or_else(|| StorageError::InvalidIp(ip.to_owned()))?;
        let rows = waf::Entity::find()
            .filter(waf::Column::Ip.eq(key.to_vec()))
            .all(&self.db)
            .await?;
        if rows.is_empty() {
            return Ok(false);
        }
        let total: u64 = rows.iter().map(|r| r.count.max(0) as u64).sum();
        let latest = rows
            .iter()
            .map(|r| r.block_timestamp.max(0) as u64)
            .max()
            .unwrap_or(0);
        Ok(is_blocked(total, latest, Utc::now().timestamp().max(0) as u64))
    }

    pub async fn unblock_ip(&self, ip: &str, identifier: i64) -> Result<()> {
        if ip.is_empty() {
            return Ok(());
        }
        let key = ip_to_binary(ip).ok_or_else(|| StorageError::InvalidIp(ip.to_owned()))?;
        waf::Entity::delete_many()
            .filter(waf::Column::Ip.eq(key.to_vec()))
            .filter(waf::Column::BlockIdentifier.eq(identifier))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Removes every block row for the given addresses.
    pub async fn batch_unblock_ip(&self, ips: &[String]) -> Result<()> {
        let keys: Vec<Vec<u8>> = ips
            .iter()
            .filter_map(|ip| ip_to_binary(ip).map(|k| k.to_vec()))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        waf::Entity::delete_many()
            .filter(waf::Column::Ip.is_in(keys))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::is_blocked;

    #[test]
    fn fresh_event_blocks_for_at_least_three_seconds() {
        // 2^0 = 1, but the floor keeps the block alive for ts+3
        assert!(is_blocked(0, 100, 102));
        assert!(!is_blocked(0, 100, 103));
    }

    #[test]
    fn penalty_grows_exponentially() {
        assert!(is_blocked(4, 100, 115)); // 2^4 = 16 -> until 116
        assert!(!is_blocked(4, 100, 116));
    }

    #[test]
    fn huge_counts_saturate() {
        assert!(is_blocked(64, 0, u64::MAX - 1));
        assert!(is_blocked(99999, 1, u64::MAX - 1));
    }
}
