//! Notification endpoints: templated webhook payloads, mute labels with
//! exponential backoff, and group fan-out.

pub mod error;
pub mod hub;
pub mod mute;
pub mod sender;
pub mod template;

#[cfg(test)]
mod tests;

pub use error::{NotifyError, Result};
pub use hub::NotificationHub;
pub use mute::{mute_label, MuteCache};
pub use template::ServerContext;

/// A single webhook-style notification endpoint.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub request_method: RequestMethod,
    pub request_type: RequestType,
    /// JSON object of extra request headers.
    pub request_header: String,
    /// Body template; for form requests, a JSON object of field templates.
    pub request_body: String,
    pub verify_tls: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

impl RequestMethod {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(RequestMethod::Get),
            2 => Ok(RequestMethod::Post),
            other => Err(NotifyError::UnsupportedMethod(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Json,
    Form,
}

impl RequestType {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(RequestType::Json),
            2 => Ok(RequestType::Form),
            other => Err(NotifyError::UnsupportedType(other)),
        }
    }
}
