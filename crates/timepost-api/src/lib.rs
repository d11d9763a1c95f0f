//! Webhook receiver for pushed time events.
//!
//! Push-mode counterpart of the long-poll client: the remote service POSTs
//! one event per request to `/receiveTimePostedEvent`, and the answer's
//! status code tells it whether to retry. Redelivered events are answered
//! from the dedup store without reaching the handler again.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use timepost_core::{Clock, DedupStore, Handler, InFlight};
use timepost_delivery::{SharedStats, StatusReporter};

pub mod handlers;
pub mod server;

pub use handlers::receive::{outcome_response, WebhookResponse, CALLER_KEY_HEADER};
pub use server::{create_router, WebhookConfig, WebhookServer};

/// Identifies this connector in every webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorInfo {
    /// Connector name.
    pub name: String,
    /// Connector version.
    pub version: String,
}

impl Default for ConnectorInfo {
    fn default() -> Self {
        Self { name: "timepost".to_string(), version: env!("CARGO_PKG_VERSION").to_string() }
    }
}

/// Shared state of the webhook routes.
#[derive(Clone)]
pub struct AppState {
    /// Dedup store.
    pub store: Arc<dyn DedupStore>,
    /// Event handler.
    pub handler: Arc<dyn Handler>,
    /// Status reporter.
    pub reporter: Arc<StatusReporter>,
    /// Delivery counters.
    pub stats: SharedStats,
    /// Ids currently being handled.
    pub in_flight: InFlight,
    /// Expected caller key, if callers must present one.
    pub caller_key: Option<Arc<str>>,
    /// Connector identity for responses.
    pub connector: Arc<ConnectorInfo>,
    /// Clock for health timestamps.
    pub clock: Arc<dyn Clock>,
}
