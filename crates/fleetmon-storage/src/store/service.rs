use crate::entities::service;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_services(&self) -> Result<Vec<service::Model>> {
        find_all::<service::Entity>(&self.db).await
    }
}
