use crate::entities::nat;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_nats(&self) -> Result<Vec<nat::Model>> {
        find_all::<nat::Entity>(&self.db).await
    }
}
