use crate::entities::alert_rule;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_alert_rules(&self) -> Result<Vec<alert_rule::Model>> {
        find_all::<alert_rule::Entity>(&self.db).await
    }
}
