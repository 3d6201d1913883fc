use chrono::{Duration, Utc};

use crate::store::history::NewServiceHistory;
use crate::store::transfer::NewTransfer;
use crate::store::waf::BlockReason;
use crate::{Store, BLOCK_ID_GRPC, BLOCK_ID_MANUAL};

async fn setup() -> Store {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    store.bootstrap().await.unwrap();
    store
}

#[tokio::test]
async fn create_and_list_servers() {
    let store = setup().await;

    let created = store
        .create_server(1, "3a1f0d04-0f6c-4c4e-bd51-7f0d4c6d8f11", "wiggly-otter")
        .await
        .unwrap();
    assert!(created.id > 0);

    let all = store.list_servers().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].uuid, "3a1f0d04-0f6c-4c4e-bd51-7f0d4c6d8f11");
    assert_eq!(all[0].user_id, 1);
}

#[tokio::test]
async fn delete_servers_cascades_transfers() {
    let store = setup().await;
    let s = store
        .create_server(1, "9d5adf4e-74a7-4f85-b2b4-2a9f2a3c94a0", "brave-finch")
        .await
        .unwrap();

    store
        .insert_transfers(vec![NewTransfer {
            server_id: s.id as u64,
            transfer_in: 1000,
            transfer_out: 500,
            recorded_at: Utc::now(),
        }])
        .await
        .unwrap();

    store.delete_servers(&[s.id as u64]).await.unwrap();
    assert!(store.list_servers().await.unwrap().is_empty());
    let (tin, tout) = store
        .transfer_usage_since(s.id as u64, Utc::now() - Duration::days(1))
        .await
        .unwrap();
    assert_eq!((tin, tout), (0, 0));
}

#[tokio::test]
async fn transfer_usage_sums_rows_in_range() {
    let store = setup().await;
    let now = Utc::now();
    store
        .insert_transfers(vec![
            NewTransfer {
                server_id: 7,
                transfer_in: 100,
                transfer_out: 10,
                recorded_at: now - Duration::hours(2),
            },
            NewTransfer {
                server_id: 7,
                transfer_in: 200,
                transfer_out: 20,
                recorded_at: now,
            },
            NewTransfer {
                server_id: 8,
                transfer_in: 999,
                transfer_out: 999,
                recorded_at: now,
            },
        ])
        .await
        .unwrap();

    let (tin, tout) = store
        .transfer_usage_since(7, now - Duration::hours(3))
        .await
        .unwrap();
    assert_eq!((tin, tout), (300, 30));

    let (tin, _) = store
        .transfer_usage_since(7, now - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(tin, 200);
}

#[tokio::test]
async fn service_history_retention() {
    let store = setup().await;
    let now = Utc::now();

    // fresh aggregate row, old aggregate row, stale per-reporter row
    store
        .create_service_history(NewServiceHistory {
            service_id: 1,
            server_id: 0,
            avg_delay: 10.0,
            up: 30,
            down: 0,
            data: String::new(),
        })
        .await
        .unwrap();

    let rows = store
        .list_aggregate_histories_since(now - Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].up, 30);

    // a service that no longer exists is swept regardless of age
    store.prune_service_histories(now, &[2]).await.unwrap();
    let rows = store
        .list_aggregate_histories_since(now - Duration::minutes(1))
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn waf_block_unblock_round_trip() {
    let store = setup().await;

    store
        .block_ip("198.51.100.7", BlockReason::Manual, BLOCK_ID_MANUAL)
        .await
        .unwrap();
    assert!(store.check_ip("198.51.100.7").await.unwrap());

    store.unblock_ip("198.51.100.7", BLOCK_ID_MANUAL).await.unwrap();
    assert!(!store.check_ip("198.51.100.7").await.unwrap());
}

#[tokio::test]
async fn waf_counts_accumulate_across_identifiers() {
    let store = setup().await;

    store
        .block_ip("203.0.113.9", BlockReason::AgentAuthFail, BLOCK_ID_GRPC)
        .await
        .unwrap();
    store
        .block_ip("203.0.113.9", BlockReason::LoginFail, 42)
        .await
        .unwrap();
    assert!(store.check_ip("203.0.113.9").await.unwrap());

    store
        .batch_unblock_ip(&["203.0.113.9".to_string()])
        .await
        .unwrap();
    assert!(!store.check_ip("203.0.113.9").await.unwrap());

    // unknown addresses are never blocked
    assert!(!store.check_ip("192.0.2.1").await.unwrap());
}
