//! Transport contract shared by the long-poll client and the webhook server.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{error::Result, health::HealthProvider};

/// A delivery mechanism the controller can start and stop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;

    /// Starts background work and returns once the transport is serving.
    async fn start(&self) -> Result<()>;

    /// True between a successful `start` and the end of `stop`, or until the
    /// transport dies on its own.
    fn is_running(&self) -> bool;

    /// Stops accepting work and drains what is queued.
    ///
    /// Returns [`crate::CoreError::ShutdownTimeout`] when draining takes
    /// longer than `timeout`.
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Transport-specific health.
    async fn is_healthy(&self) -> bool;
}

/// Exposes a transport's health to the aggregator.
pub struct TransportHealth(pub Arc<dyn Transport>);

#[async_trait]
impl HealthProvider for TransportHealth {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn is_healthy(&self) -> bool {
        self.0.is_healthy().await
    }
}
