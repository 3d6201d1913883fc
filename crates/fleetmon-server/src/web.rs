use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::ServerError;
use crate::sentinel::ServiceStatsView;
use crate::state::AppState;

/// An agent is shown online while its last state report is this recent.
const ONLINE_GRACE_SECS: i64 = 30;

/// The read-only status surface; the full CRUD dashboard lives elsewhere.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/servers", get(list_servers))
        .route("/api/v1/services", get(list_services))
        .route("/api/v1/servers/:id/config", get(server_config))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ServerView {
    id: u64,
    name: String,
    display_index: i64,
    country_code: String,
    last_active: Option<DateTime<Utc>>,
    online: bool,
    boot_time: u64,
    cpu: f64,
    mem_used: u64,
    net_in_speed: u64,
    net_out_speed: u64,
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerView>> {
    let now = Utc::now();
    let views = state
        .registry
        .sorted_list()
        .iter()
        .map(|agent| {
            let meta = agent.meta();
            let live = agent.live();
            ServerView {
                id: agent.id,
                name: meta.name,
                display_index: meta.display_index,
                country_code: live.geoip.country_code.clone(),
                last_active: live.last_active,
                online: live
                    .last_active
                    .is_some_and(|t| now - t < Duration::seconds(ONLINE_GRACE_SECS)),
                boot_time: live.host.boot_time,
                cpu: live.state.cpu,
                mem_used: live.state.mem_used,
                net_in_speed: live.state.net_in_speed,
                net_out_speed: live.state.net_out_speed,
            }
        })
        .collect();
    Json(views)
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceStatsView>> {
    Json(state.sentinel.stats())
}

async fn server_config(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<String, (StatusCode, String)> {
    crate::rpc::fetch_agent_config(&state, id)
        .await
        .map_err(|e| match e {
            ServerError::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
            ServerError::AgentOffline(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })
}
