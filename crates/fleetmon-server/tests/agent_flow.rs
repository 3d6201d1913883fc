use chrono::{Duration, Utc};
use tonic::Request;

use fleetmon_common::types::HostState;
use fleetmon_server::config::Config;
use fleetmon_server::rpc::auth;
use fleetmon_server::state::AppState;
use fleetmon_server::housekeeping;
use fleetmon_storage::Store;

const SECRET: &str = "integration-test-agent-secret";
const UUID_A: &str = "3b241101-e2bb-4255-8caf-4136c566a962";

async fn build_state() -> AppState {
    let mut config = Config::default();
    config.agent_secret_key = SECRET.into();
    config.jwt_secret_key = "test".into();
    let store = Store::connect("sqlite::memory:").await.unwrap();
    store.bootstrap().await.unwrap();
    let (state, _dispatch_rx) = AppState::build(config, store).await.unwrap();
    state
}

fn agent_request(secret: &str, uuid: &str) -> Request<()> {
    let mut request = Request::new(());
    request
        .metadata_mut()
        .insert("client_secret", secret.parse().unwrap());
    request
        .metadata_mut()
        .insert("client_uuid", uuid.parse().unwrap());
    request
}

#[tokio::test]
async fn unknown_uuid_registers_a_server() {
    let state = build_state().await;

    let request = agent_request(SECRET, UUID_A);
    let (ip, secret, uuid) = auth::extract(&state, &request);
    let id = auth::check(&state, ip, secret, uuid).await.unwrap();
    assert!(id > 0);

    // visible in the registry and in the uuid index
    assert_eq!(state.registry.uuid_to_id(UUID_A), Some(id));
    let agent = state.registry.get(id).unwrap();
    assert!(!agent.meta().name.is_empty());

    // persisted
    let rows = state.store.list_servers().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uuid, UUID_A);

    // a reconnect resolves to the same id instead of creating another row
    let (ip, secret, uuid) = auth::extract(&state, &request);
    let id_again = auth::check(&state, ip, secret, uuid).await.unwrap();
    assert_eq!(id_again, id);
    assert_eq!(state.store.list_servers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let state = build_state().await;

    let request = agent_request("not-the-secret", UUID_A);
    let (ip, secret, uuid) = auth::extract(&state, &request);
    let err = auth::check(&state, ip, secret, uuid).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unauthenticated);
    assert!(state.registry.uuid_to_id(UUID_A).is_none());
}

#[tokio::test]
async fn malformed_uuid_is_rejected() {
    let state = build_state().await;

    let request = agent_request(SECRET, "not-a-uuid");
    let (ip, secret, uuid) = auth::extract(&state, &request);
    let err = auth::check(&state, ip, secret, uuid).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unauthenticated);
}

#[tokio::test]
async fn hourly_rollup_persists_the_counter_delta() {
    let state = build_state().await;
    let request = agent_request(SECRET, UUID_A);
    let (ip, secret, uuid) = auth::extract(&state, &request);
    let id = auth::check(&state, ip, secret, uuid).await.unwrap();
    let agent = state.registry.get(id).unwrap();

    let mut frame = HostState {
        net_in_transfer: 5_000,
        net_out_transfer: 700,
        ..HostState::default()
    };
    agent.record_state(frame.clone(), Utc::now());
    frame.net_in_transfer = 8_000;
    frame.net_out_transfer = 1_000;
    agent.record_state(frame, Utc::now());

    housekeeping::record_transfer_hourly_usage(&state).await;

    let (tx_in, tx_out) = state
        .store
        .transfer_usage_since(id, Utc::now() - Duration::hours(2))
        .await
        .unwrap();
    assert_eq!((tx_in, tx_out), (3_000, 300));

    // the snapshot advanced: a second rollup with no new traffic is a no-op
    housekeeping::record_transfer_hourly_usage(&state).await;
    let (tx_in, _) = state
        .store
        .transfer_usage_since(id, Utc::now() - Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(tx_in, 3_000);
}
