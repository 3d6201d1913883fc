//! SQLite persistence for the dashboard.
//!
//! A single [`Store`] wraps the sea-orm connection; per-table query methods
//! live in the [`store`] submodules. Tables are bootstrapped from the entity
//! definitions at startup (there is no separate migration history).

pub mod entities;
pub mod error;
pub mod store;

#[cfg(test)]
mod tests;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema};

pub use error::{Result, StorageError};
pub use store::waf::{BlockReason, BLOCK_ID_GRPC, BLOCK_ID_MANUAL, BLOCK_ID_TOKEN, BLOCK_ID_UNKNOWN_USER};

#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    /// Connects to the database. `url` is a sqlx-style URL, e.g.
    /// `sqlite://data/sqlite.db?mode=rwc` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url).await?;
        Ok(Self { db })
    }

    /// Creates any missing tables from the entity definitions.
    pub async fn bootstrap(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        macro_rules! ensure_table {
            ($entity:expr) => {{
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            }};
        }

        ensure_table!(entities::server::Entity);
        ensure_table!(entities::user::Entity);
        ensure_table!(entities::server_group::Entity);
        ensure_table!(entities::server_group_server::Entity);
        ensure_table!(entities::notification::Entity);
        ensure_table!(entities::notification_group::Entity);
        ensure_table!(entities::notification_group_notification::Entity);
        ensure_table!(entities::alert_rule::Entity);
        ensure_table!(entities::service::Entity);
        ensure_table!(entities::service_history::Entity);
        ensure_table!(entities::cron::Entity);
        ensure_table!(entities::transfer::Entity);
        ensure_table!(entities::nat::Entity);
        ensure_table!(entities::ddns_profile::Entity);
        ensure_table!(entities::waf::Entity);

        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Fetch every row of an entity; shared by the in-memory registries that load
/// their full table at startup.
pub(crate) async fn find_all<E: EntityTrait>(
    db: &DatabaseConnection,
) -> Result<Vec<E::Model>> {
    Ok(E::find().all(db).await?)
}
