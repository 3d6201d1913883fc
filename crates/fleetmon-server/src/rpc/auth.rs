use std::sync::Arc;

use tonic::{Request, Status};

use fleetmon_common::util::ip_from_header;
use fleetmon_storage::store::waf::BlockReason;
use fleetmon_storage::BLOCK_ID_GRPC;

use crate::config::USE_PEER_IP;
use crate::registry::{Agent, AgentMeta};
use crate::state::AppState;

/// Words used for the generated display name of a first-time agent.
const GENERATED_NAME_WORDS: u8 = 2;

/// Resolves the connecting peer address, honoring the configured forwarded
/// header unless it is the use-peer-ip sentinel.
pub fn real_ip<T>(state: &AppState, request: &Request<T>) -> String {
    let peer = request
        .remote_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();

    let header = state.with_config(|c| c.agent_real_ip_header.clone());
    if header.is_empty() || header == USE_PEER_IP {
        return peer;
    }
    request
        .metadata()
        .get(header.to_lowercase())
        .and_then(|v| v.to_str().ok())
        .and_then(ip_from_header)
        .unwrap_or(peer)
}

/// Pulls the caller ip, client secret, and client uuid out of a request's
/// peer info and metadata. Split out from `check` so the values can be
/// extracted before the request (whose body may not be `Sync`) needs to be
/// held across an `.await` inside a `Send` future.
pub fn extract<T>(state: &AppState, request: &Request<T>) -> (String, String, String) {
    let ip = real_ip(state, request);
    let metadata = request.metadata();
    let secret = metadata
        .get("client_secret")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_owned();
    let uuid = metadata
        .get("client_uuid")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    (ip, secret, uuid)
}

/// The auth handshake run by every streaming endpoint: WAF gate, secret ->
/// user resolution, UUID validation, and first-contact server creation.
/// Returns the resolved server id.
pub async fn check(state: &AppState, ip: String, secret: String, uuid: String) -> Result<u64, Status> {
    match state.store.check_ip(&ip).await {
        Ok(true) => return Err(Status::permission_denied("you are blocked by the dashboard")),
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "waf lookup failed");
        }
    }

    if secret.is_empty() {
        return Err(Status::unauthenticated("client auth failed"));
    }

    let Some(user_id) = state.users.user_for_secret(&secret) else {
        if let Err(e) = state
            .store
            .block_ip(&ip, BlockReason::AgentAuthFail, BLOCK_ID_GRPC)
            .await
        {
            tracing::error!(error = %e, "failed to record waf event");
        }
        return Err(Status::unauthenticated("client auth failed"));
    };

    if let Err(e) = state.store.unblock_ip(&ip, BLOCK_ID_GRPC).await {
        tracing::error!(error = %e, "failed to clear waf record");
    }

    if uuid::Uuid::parse_str(&uuid).is_err() {
        return Err(Status::unauthenticated("invalid client uuid"));
    }

    if let Some(id) = state.registry.uuid_to_id(&uuid) {
        return Ok(id);
    }

    // first contact: create the server with a generated display name
    let name = petname::petname(GENERATED_NAME_WORDS, "-");
    let model = state
        .store
        .create_server(user_id, &uuid, &name)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to persist new server");
            Status::internal("database error")
        })?;

    let agent = Arc::new(Agent::new(
        model.id as u64,
        uuid.to_owned(),
        AgentMeta::from_model(&model),
    ));
    let id = agent.id;
    state.registry.insert(agent);
    tracing::info!(server_id = id, uuid, "registered new agent");
    Ok(id)
}
