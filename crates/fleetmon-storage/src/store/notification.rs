use crate::entities::{notification, notification_group, notification_group_notification};
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_notifications(&self) -> Result<Vec<notification::Model>> {
        find_all::<notification::Entity>(&self.db).await
    }

    pub async fn list_notification_groups(&self) -> Result<Vec<notification_group::Model>> {
        find_all::<notification_group::Entity>(&self.db).await
    }

    /// (group id, notification id) pairs of the join relation.
    pub async fn list_notification_group_members(&self) -> Result<Vec<(u64, u64)>> {
        let rows = find_all::<notification_group_notification::Entity>(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.notification_group_id as u64, r.notification_id as u64))
            .collect())
    }
}
