//! Handler that forwards events to a local HTTP endpoint.
//!
//! The endpoint's answer decides the outcome: 2xx is a success (an `id`
//! field in the response body becomes the external id), 429 and 5xx are
//! transient, any other 4xx is permanent. Connection failures and timeouts
//! are transient.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use timepost_core::{Event, Handler, Outcome};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// Forwards each event as a JSON POST.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    client: reqwest::Client,
    url: String,
}

impl ForwardingHandler {
    /// Creates a handler posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("timepost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url: url.into() })
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Handler for ForwardingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<Outcome> {
        let response = match self.client.post(&self.url).json(event).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(Outcome::transient("forward target timed out").with_error(e.to_string()));
            },
            Err(e) => {
                return Ok(Outcome::transient("forward target unreachable").with_error(e.to_string()));
            },
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(event_id = %event.id, status = status.as_u16(), "forward target answered");

        let outcome = if status.is_success() {
            let external_id = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|doc| match doc.get("id") {
                    Some(serde_json::Value::String(id)) => Some(id.clone()),
                    Some(serde_json::Value::Number(id)) => Some(id.to_string()),
                    _ => None,
                });
            Outcome::Success { external_id, message: Some(format!("forwarded: HTTP {}", status.as_u16())) }
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Outcome::transient(format!("forward target unavailable: HTTP {}", status.as_u16()))
                .with_error(body)
        } else {
            Outcome::permanent(format!("forward target rejected event: HTTP {}", status.as_u16()))
                .with_error(body)
        };
        Ok(outcome)
    }
}
