//! Fallback handler that only logs.

use async_trait::async_trait;
use timepost_core::{Event, Handler, Outcome};
use tracing::info;

/// Acknowledges every event after logging it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<Outcome> {
        info!(event_id = %event.id, fields = event.payload.len(), "time event received");
        Ok(Outcome::success())
    }
}
