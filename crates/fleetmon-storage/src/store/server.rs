use chrono::Utc;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};

use crate::entities::{server, server_group_server, transfer};
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_servers(&self) -> Result<Vec<server::Model>> {
        find_all::<server::Entity>(&self.db).await
    }

    /// Creates a server row for a first-time agent connection.
    pub async fn create_server(
        &self,
        user_id: u64,
        uuid: &str,
        name: &str,
    ) -> Result<server::Model> {
        let now = Utc::now();
        let row = server::ActiveModel {
            id: NotSet,
            created_at: Set(now),
            updated_at: Set(now),
            user_id: Set(user_id as i64),
            name: Set(name.to_owned()),
            uuid: Set(uuid.to_owned()),
            note: Set(String::new()),
            public_note: Set(String::new()),
            display_index: Set(0),
            hide_for_guest: Set(false),
            enable_ddns: Set(false),
            ddns_profiles_raw: Set("[]".to_owned()),
            override_ddns_domains_raw: Set("{}".to_owned()),
        };
        Ok(row.insert(&self.db).await?)
    }

    pub async fn save_server(&self, model: server::Model) -> Result<server::Model> {
        let mut active: server::ActiveModel = model.into();
        active.updated_at = Set(Utc::now());
        let active = active.reset_all();
        Ok(active.update(&self.db).await?)
    }

    /// Deletes servers together with their group memberships and transfer
    /// history.
    pub async fn delete_servers(&self, ids: &[u64]) -> Result<()> {
        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        let txn = self.db.begin().await?;
        server_group_server::Entity::delete_many()
            .filter(server_group_server::Column::ServerId.is_in(ids.clone()))
            .exec(&txn)
            .await?;
        transfer::Entity::delete_many()
            .filter(transfer::Column::ServerId.is_in(ids.clone()))
            .exec(&txn)
            .await?;
        server::Entity::delete_many()
            .filter(server::Column::Id.is_in(ids))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }
}
