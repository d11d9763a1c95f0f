//! HTTP implementation of [`RemoteClient`].
//!
//! Fetches pending events with `GET {base}/api/time-events?limit=N` and
//! reports outcomes with `POST {base}/api/time-events/{id}/status`. Response
//! status codes are mapped onto [`DeliveryError`] variants so callers can
//! decide what to retry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use timepost_core::Event;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    remote::{RemoteClient, StatusReport},
};

/// Retry-After fallback when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECONDS: u64 = 60;

/// Longest error body kept in error values.
const MAX_ERROR_BODY: usize = 1024;

/// Configuration for [`HttpRemoteClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the remote service.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_token: Option<String>,
    /// Per-request timeout. Long-poll fetches may hold the connection open
    /// for most of this.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9090".to_string(),
            api_token: None,
            timeout: Duration::from_secs(30),
            user_agent: concat!("timepost/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Remote client over reqwest.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: Url,
    config: ClientConfig,
}

impl HttpRemoteClient {
    /// Builds a client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for an unparsable base URL or when the
    /// HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            DeliveryError::configuration(format!("invalid base url {}: {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(DeliveryError::configuration(format!(
                "base url {} cannot carry a path",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, base_url, config })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| DeliveryError::configuration("base url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = match self.authorize(request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
            },
            Err(e) if e.is_connect() => {
                return Err(DeliveryError::network(format!("connection failed: {e}")));
            },
            Err(e) => return Err(DeliveryError::network(e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS);
            return Err(DeliveryError::rate_limited(retry_after));
        }

        let body = read_error_body(response).await;
        if status.is_server_error() {
            Err(DeliveryError::server_error(status.as_u16(), body))
        } else {
            Err(DeliveryError::client_error(status.as_u16(), body))
        }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn fetch(&self, limit: usize) -> Result<Vec<Event>> {
        let mut url = self.endpoint(&["api", "time-events"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());

        async move {
            let response = self.send(self.client.get(url)).await?;
            let documents: Vec<serde_json::Value> = response
                .json()
                .await
                .map_err(|e| DeliveryError::invalid_response(format!("event batch: {e}")))?;

            let mut events = Vec::with_capacity(documents.len());
            for document in documents {
                match serde_json::from_value::<Event>(document) {
                    Ok(event) if event.validate().is_ok() => events.push(event),
                    Ok(event) => warn!(event_id = %event.id, "dropping event with unusable id"),
                    Err(e) => warn!(error = %e, "dropping malformed event"),
                }
            }
            debug!(count = events.len(), "fetched events");
            Ok(events)
        }
        .instrument(info_span!("fetch_events", limit))
        .await
    }

    async fn report_status(&self, report: &StatusReport) -> Result<()> {
        let url = self.endpoint(&["api", "time-events", report.id.as_str(), "status"])?;

        async move {
            self.send(self.client.post(url).json(report)).await?;
            debug!("status reported");
            Ok(())
        }
        .instrument(info_span!("report_status", event_id = %report.id, status = %report.status))
        .await
    }
}

async fn read_error_body(response: Response) -> String {
    match response.text().await {
        Ok(text) if text.len() > MAX_ERROR_BODY => {
            let mut end = MAX_ERROR_BODY;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated)", &text[..end])
        },
        Ok(text) => text,
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}
