use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use fleetmon_storage::store::waf::BlockReason;
use fleetmon_storage::{Store, BLOCK_ID_MANUAL};

use crate::error::Result;

/// Something that can terminate a live dashboard session (in practice the
/// websocket writer's close handle).
pub trait SessionHandle: Send + Sync {
    fn close(&self);
}

/// A logged-in dashboard session. Process-lifetime only.
pub struct OnlineUser {
    pub user_id: u64,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    pub conn: Option<Arc<dyn SessionHandle>>,
}

/// Registry of live dashboard sessions, keyed by connection id.
#[derive(Default)]
pub struct OnlineUserTable {
    sessions: Mutex<HashMap<String, Arc<OnlineUser>>>,
}

impl OnlineUserTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn_id: &str, user: OnlineUser) {
        self.sessions
            .lock()
            .unwrap()
            .insert(conn_id.to_owned(), Arc::new(user));
    }

    pub fn remove(&self, conn_id: &str) {
        self.sessions.lock().unwrap().remove(conn_id);
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Sessions ordered by connect time, paginated.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<Arc<OnlineUser>> {
        let mut users: Vec<Arc<OnlineUser>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        users.sort_by_key(|u| u.connected_at);
        users.into_iter().skip(offset).take(limit).collect()
    }

    /// Manually blocks the given addresses and closes any sessions they
    /// hold open.
    pub async fn block_by_ips(&self, store: &Store, ips: &[String]) -> Result<()> {
        for ip in ips {
            store
                .block_ip(ip, BlockReason::Manual, BLOCK_ID_MANUAL)
                .await?;
            let to_close: Vec<Arc<OnlineUser>> = self
                .sessions
                .lock()
                .unwrap()
                .values()
                .filter(|u| u.ip == *ip)
                .cloned()
                .collect();
            for user in to_close {
                if let Some(conn) = &user.conn {
                    conn.close();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle(Arc<AtomicUsize>);

    impl SessionHandle for CountingHandle {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn list_is_ordered_and_paginated() {
        let table = OnlineUserTable::new();
        let base = Utc::now();
        for i in 0..5u64 {
            table.add(
                &format!("conn-{i}"),
                OnlineUser {
                    user_id: i,
                    ip: "198.51.100.1".into(),
                    connected_at: base + chrono::Duration::seconds(i as i64),
                    conn: None,
                },
            );
        }

        let page = table.list(2, 1);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].user_id, 1);
        assert_eq!(page[1].user_id, 2);
        assert!(table.list(10, 5).is_empty());

        table.remove("conn-0");
        assert_eq!(table.count(), 4);
    }

    #[tokio::test]
    async fn block_by_ips_closes_matching_sessions() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.bootstrap().await.unwrap();

        let table = OnlineUserTable::new();
        let closed = Arc::new(AtomicUsize::new(0));
        table.add(
            "conn-a",
            OnlineUser {
                user_id: 1,
                ip: "203.0.113.7".into(),
                connected_at: Utc::now(),
                conn: Some(Arc::new(CountingHandle(closed.clone()))),
            },
        );
        table.add(
            "conn-b",
            OnlineUser {
                user_id: 2,
                ip: "203.0.113.8".into(),
                connected_at: Utc::now(),
                conn: Some(Arc::new(CountingHandle(closed.clone()))),
            },
        );

        table
            .block_by_ips(&store, &["203.0.113.7".to_string()])
            .await
            .unwrap();

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(store.check_ip("203.0.113.7").await.unwrap());
        assert!(!store.check_ip("203.0.113.8").await.unwrap());
    }
}
