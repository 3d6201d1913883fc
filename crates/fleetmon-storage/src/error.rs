/// Errors surfaced by the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found.
    #[error("storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: u64 },

    /// An underlying database error.
    #[error("storage: database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// JSON (de)serialization failure on a raw column.
    #[error("storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller passed an address the WAF cannot key on.
    #[error("storage: invalid ip address '{0}'")]
    InvalidIp(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;
