use crate::entities::ddns_profile;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_ddns_profiles(&self) -> Result<Vec<ddns_profile::Model>> {
        find_all::<ddns_profile::Entity>(&self.db).await
    }
}
