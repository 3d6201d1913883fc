use std::collections::HashMap;
use std::sync::RwLock;

use fleetmon_common::util::random_string;
use fleetmon_storage::Store;

use crate::error::Result;

const AGENT_SECRET_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Member,
    Admin,
}

impl Role {
    pub fn from_i64(v: i64) -> Self {
        if v == 1 {
            Role::Admin
        } else {
            Role::Member
        }
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub role: Role,
    pub agent_secret: String,
}

#[derive(Default)]
struct UserMaps {
    info: HashMap<u64, UserInfo>,
    secret_to_id: HashMap<String, u64>,
}

/// Per-user roles and agent secrets; the secret index backs the gRPC auth
/// handshake.
#[derive(Default)]
pub struct UserIndex {
    maps: RwLock<UserMaps>,
}

impl UserIndex {
    /// Loads all users. User id 0 is the built-in admin bound to the
    /// dashboard-wide agent secret; accounts without a secret get one
    /// generated and persisted.
    pub async fn load(store: &Store, dashboard_agent_secret: &str) -> Result<Self> {
        let mut maps = UserMaps::default();
        maps.info.insert(
            0,
            UserInfo {
                role: Role::Admin,
                agent_secret: dashboard_agent_secret.to_owned(),
            },
        );
        maps.secret_to_id
            .insert(dashboard_agent_secret.to_owned(), 0);

        for user in store.list_users().await? {
            let id = user.id as u64;
            let secret = if user.agent_secret.is_empty() {
                let generated = random_string(AGENT_SECRET_LENGTH);
                store.set_user_agent_secret(id, &generated).await?;
                generated
            } else {
                user.agent_secret
            };
            maps.secret_to_id.insert(secret.clone(), id);
            maps.info.insert(
                id,
                UserInfo {
                    role: Role::from_i64(user.role),
                    agent_secret: secret,
                },
            );
        }

        Ok(Self {
            maps: RwLock::new(maps),
        })
    }

    pub fn user_for_secret(&self, secret: &str) -> Option<u64> {
        self.maps.read().unwrap().secret_to_id.get(secret).copied()
    }

    pub fn role(&self, user_id: u64) -> Role {
        self.maps
            .read()
            .unwrap()
            .info
            .get(&user_id)
            .map(|u| u.role)
            .unwrap_or_default()
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.role(user_id).is_admin()
    }

    pub fn upsert(&self, user_id: u64, info: UserInfo) {
        let mut maps = self.maps.write().unwrap();
        maps.secret_to_id.insert(info.agent_secret.clone(), user_id);
        maps.info.insert(user_id, info);
    }

    pub fn remove(&self, user_id: u64) {
        let mut maps = self.maps.write().unwrap();
        if let Some(info) = maps.info.remove(&user_id) {
            maps.secret_to_id.remove(&info.agent_secret);
        }
    }
}
