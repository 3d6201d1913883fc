/// Errors surfaced by the notification subsystem. Delivery failures are
/// logged by the hub and never propagate past it.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The endpoint's stored method/type discriminator is unknown.
    #[error("notify: unsupported request method {0}")]
    UnsupportedMethod(i32),

    #[error("notify: unsupported request type {0}")]
    UnsupportedType(i32),

    /// The form-mode request body is not a flat JSON object.
    #[error("notify: invalid request body template: {0}")]
    InvalidBody(String),

    /// An HTTP request to the endpoint failed outright.
    #[error("notify: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("notify: endpoint returned {status}: {body}")]
    Api { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, NotifyError>;
