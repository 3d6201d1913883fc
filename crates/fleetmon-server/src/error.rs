use fleetmon_storage::StorageError;

/// Errors raised by the coordination layer; the RPC and HTTP edges map them
/// to transport envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("client auth failed")]
    AuthFailed,

    #[error("invalid client uuid")]
    InvalidUuid,

    #[error("blocked by WAF")]
    Blocked,

    #[error("{entity} id {id} does not exist")]
    NotFound { entity: &'static str, id: u64 },

    #[error("invalid cron spec '{spec}': {reason}")]
    InvalidCron { spec: String, reason: String },

    #[error("server {0} is offline")]
    AgentOffline(u64),

    #[error("io stream {0} not found")]
    StreamNotFound(String),

    #[error("io stream {0} already has this endpoint")]
    StreamBusy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
