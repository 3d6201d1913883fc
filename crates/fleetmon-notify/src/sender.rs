use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;

use crate::template::{json_escape, no_escape, render, url_escape, ServerContext};
use crate::{Notification, NotifyError, RequestMethod, RequestType, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Builds and executes the HTTP requests for notification endpoints. Holds
/// one verifying client and one that skips TLS verification, selected per
/// endpoint by its `verify_tls` flag.
pub struct Sender {
    verified: reqwest::Client,
    insecure: reqwest::Client,
    location: Tz,
}

impl Sender {
    pub fn new(location: Tz) -> Self {
        let verified = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_default();
        let insecure = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            verified,
            insecure,
            location,
        }
    }

    /// Delivers one message to one endpoint. Non-2xx responses are errors;
    /// the caller decides whether to log or propagate.
    pub async fn send(
        &self,
        n: &Notification,
        message: &str,
        server: Option<&ServerContext>,
    ) -> Result<()> {
        let now = Utc::now();
        let url = render(&n.url, message, server, now, self.location, &url_escape);

        let client = if n.verify_tls {
            &self.verified
        } else {
            &self.insecure
        };

        let mut req = match n.request_method {
            RequestMethod::Get => client.get(&url),
            RequestMethod::Post => {
                let body = match n.request_type {
                    RequestType::Json => {
                        render(&n.request_body, message, server, now, self.location, &json_escape)
                    }
                    RequestType::Form => {
                        let fields: serde_json::Map<String, serde_json::Value> =
                            serde_json::from_str(&n.request_body)
                                .map_err(|e| NotifyError::InvalidBody(e.to_string()))?;
                        let mut form = url::form_urlencoded::Serializer::new(String::new());
                        for (key, value) in fields {
                            let raw = value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string());
                            let rendered =
                                render(&raw, message, server, now, self.location, &no_escape);
                            form.append_pair(&key, &rendered);
                        }
                        form.finish()
                    }
                };
                let content_type = match n.request_type {
                    RequestType::Json => "application/json",
                    RequestType::Form => "application/x-www-form-urlencoded",
                };
                client.post(&url).header("Content-Type", content_type).body(body)
            }
        };

        if !n.request_header.is_empty() {
            if let Ok(headers) =
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&n.request_header)
            {
                for (key, value) in headers {
                    if let Some(v) = value.as_str() {
                        req = req.header(key, v);
                    }
                }
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
