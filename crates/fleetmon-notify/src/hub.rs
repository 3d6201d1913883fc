use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use chrono_tz::Tz;

use crate::mute::{mute_label, MuteCache};
use crate::sender::Sender;
use crate::template::ServerContext;
use crate::Notification;

/// Resolves notification groups to endpoints and applies the mute/backoff
/// policy before handing messages to the [`Sender`].
pub struct NotificationHub {
    list: RwLock<HashMap<u64, Arc<Notification>>>,
    group_members: RwLock<HashMap<u64, HashSet<u64>>>,
    group_names: RwLock<HashMap<u64, String>>,
    mutes: MuteCache,
    sender: Sender,
}

impl NotificationHub {
    pub fn new(location: Tz) -> Self {
        Self {
            list: RwLock::new(HashMap::new()),
            group_members: RwLock::new(HashMap::new()),
            group_names: RwLock::new(HashMap::new()),
            mutes: MuteCache::new(),
            sender: Sender::new(location),
        }
    }

    /// Replaces the endpoint and group tables, e.g. at startup.
    pub fn load(
        &self,
        notifications: Vec<Notification>,
        groups: Vec<(u64, String)>,
        members: Vec<(u64, u64)>,
    ) {
        let mut list = HashMap::new();
        for n in notifications {
            list.insert(n.id, Arc::new(n));
        }

        let mut group_names = HashMap::new();
        for (gid, name) in groups {
            group_names.insert(gid, name);
        }

        let mut group_members: HashMap<u64, HashSet<u64>> = HashMap::new();
        for (gid, nid) in members {
            if list.contains_key(&nid) {
                group_members.entry(gid).or_default().insert(nid);
            }
        }

        *self.list.write().unwrap() = list;
        *self.group_names.write().unwrap() = group_names;
        *self.group_members.write().unwrap() = group_members;
    }

    pub fn update_notification(&self, n: Notification) {
        self.list.write().unwrap().insert(n.id, Arc::new(n));
    }

    pub fn delete_notifications(&self, ids: &[u64]) {
        let mut list = self.list.write().unwrap();
        let mut members = self.group_members.write().unwrap();
        for id in ids {
            list.remove(id);
            for set in members.values_mut() {
                set.remove(id);
            }
        }
    }

    pub fn update_group(&self, id: u64, name: String, member_ids: Vec<u64>) {
        self.group_names.write().unwrap().insert(id, name);
        self.group_members
            .write()
            .unwrap()
            .insert(id, member_ids.into_iter().collect());
    }

    pub fn delete_groups(&self, ids: &[u64]) {
        let mut names = self.group_names.write().unwrap();
        let mut members = self.group_members.write().unwrap();
        for id in ids {
            names.remove(id);
            members.remove(id);
        }
    }

    pub fn group_name(&self, group_id: u64) -> String {
        self.group_names
            .read()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Clears the backoff state for `label` within the group's scope.
    pub fn unmute_notification(&self, group_id: u64, label: &str) {
        let scoped = mute_label::with_group(label, &self.group_name(group_id));
        self.mutes.unmute(&scoped);
    }

    /// Sends `message` to every endpoint of the group. With a mute label the
    /// backoff policy may drop the send entirely. Delivery errors are logged,
    /// never returned.
    pub async fn send_notification(
        &self,
        group_id: u64,
        message: &str,
        mute_label: Option<&str>,
        server: Option<&ServerContext>,
    ) {
        if let Some(label) = mute_label {
            let scoped = mute_label::with_group(label, &self.group_name(group_id));
            if !self.mutes.should_send(&scoped, Utc::now()) {
                tracing::debug!(label = %scoped, "muted repeated notification");
                return;
            }
        }

        let targets: Vec<Arc<Notification>> = {
            let members = self.group_members.read().unwrap();
            let list = self.list.read().unwrap();
            members
                .get(&group_id)
                .map(|ids| ids.iter().filter_map(|id| list.get(id).cloned()).collect())
                .unwrap_or_default()
        };

        for n in targets {
            match self.sender.send(&n, message, server).await {
                Ok(()) => {
                    tracing::info!(endpoint = %n.name, "notification sent");
                }
                Err(e) => {
                    tracing::warn!(endpoint = %n.name, error = %e, "notification failed");
                }
            }
        }
    }
}
