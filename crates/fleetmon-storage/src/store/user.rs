use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

use crate::entities::user;
use crate::{find_all, Result, Store};

impl Store {
    pub async fn list_users(&self) -> Result<Vec<user::Model>> {
        find_all::<user::Entity>(&self.db).await
    }

    /// Backfills a generated agent secret for accounts created without one.
    pub async fn set_user_agent_secret(&self, id: u64, secret: &str) -> Result<()> {
        user::Entity::update_many()
            .col_expr(user::Column::AgentSecret, Expr::value(secret))
            .filter(user::Column::Id.eq(id as i64))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
