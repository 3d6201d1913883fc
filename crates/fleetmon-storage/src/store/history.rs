use chrono::{DateTime, Duration, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter};

use crate::entities::service_history;
use crate::{Result, Store};

/// Fields for a new probe history row; `server_id` 0 marks the aggregate
/// row produced when a sliding window fills.
#[derive(Debug, Clone)]
pub struct NewServiceHistory {
    pub service_id: u64,
    pub server_id: u64,
    pub avg_delay: f32,
    pub up: u64,
    pub down: u64,
    pub data: String,
}

impl Store {
    pub async fn create_service_history(&self, row: NewServiceHistory) -> Result<()> {
        service_history::ActiveModel {
            id: NotSet,
            created_at: Set(Utc::now()),
            service_id: Set(row.service_id as i64),
            server_id: Set(row.server_id as i64),
            avg_delay: Set(row.avg_delay),
            up: Set(row.up as i64),
            down: Set(row.down as i64),
            data: Set(row.data),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// Aggregate rows (`server_id = 0`) created at or after `since`.
    pub async fn list_aggregate_histories_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<service_history::Model>> {
        Ok(service_history::Entity::find()
            .filter(service_history::Column::ServerId.eq(0i64))
            .filter(service_history::Column::CreatedAt.gte(since))
            .all(&self.db)
            .await?)
    }

    /// Aggregate rows within `[from, to)`.
    pub async fn list_aggregate_histories_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<service_history::Model>> {
        Ok(service_history::Entity::find()
            .filter(service_history::Column::ServerId.eq(0i64))
            .filter(service_history::Column::CreatedAt.gte(from))
            .filter(service_history::Column::CreatedAt.lt(to))
            .all(&self.db)
            .await?)
    }

    /// Retention pass: aggregate rows are kept 30 days, per-reporter rows
    /// 24 hours, and rows for deleted services go immediately.
    pub async fn prune_service_histories(
        &self,
        now: DateTime<Utc>,
        live_service_ids: &[u64],
    ) -> Result<()> {
        let live: Vec<i64> = live_service_ids.iter().map(|id| *id as i64).collect();

        service_history::Entity::delete_many()
            .filter(service_history::Column::CreatedAt.lt(now - Duration::days(30)))
            .exec(&self.db)
            .await?;
        service_history::Entity::delete_many()
            .filter(service_history::Column::ServerId.ne(0i64))
            .filter(service_history::Column::CreatedAt.lt(now - Duration::days(1)))
            .exec(&self.db)
            .await?;
        service_history::Entity::delete_many()
            .filter(service_history::Column::ServiceId.is_not_in(live))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
