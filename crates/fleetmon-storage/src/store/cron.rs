use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use crate::entities::cron;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_crons(&self) -> Result<Vec<cron::Model>> {
        find_all::<cron::Entity>(&self.db).await
    }

    /// Records the outcome of a command pushed to an agent.
    pub async fn update_cron_execution(
        &self,
        id: u64,
        executed_at: DateTime<Utc>,
        successful: bool,
    ) -> Result<()> {
        cron::Entity::update_many()
            .col_expr(cron::Column::LastExecutedAt, Expr::value(executed_at))
            .col_expr(cron::Column::LastResult, Expr::value(successful))
            .filter(cron::Column::Id.eq(id as i64))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
