//! The user-supplied event handler contract.

use std::{any::Any, fmt, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::FutureExt;

use crate::models::{Event, Outcome};

/// Decides what a delivered event means locally.
///
/// Expected failures are returned as [`Outcome::TransientFailure`] or
/// [`Outcome::PermanentFailure`]. An `Err` or a panic from [`Handler::handle`]
/// is treated as a bug in the handler; see [`invoke_handler`].
///
/// Pull-mode transports never call `handle` concurrently. Webhook mode may,
/// for distinct event ids.
#[async_trait]
pub trait Handler: Send + Sync + fmt::Debug {
    /// Called once before any transport starts.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Processes one event.
    async fn handle(&self, event: &Event) -> anyhow::Result<Outcome>;

    /// Primary periodic sync.
    async fn sync(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Slow periodic sync, run far less often than [`Handler::sync`].
    async fn slow_sync(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Releases resources after all transports and runners stopped.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Why a handler failed to produce an outcome.
#[derive(Debug)]
pub enum HandlerFailure {
    /// `handle` returned an error.
    Error(anyhow::Error),
    /// `handle` panicked.
    Panic(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(err) => write!(f, "{err:#}"),
            Self::Panic(message) => write!(f, "handler panicked: {message}"),
        }
    }
}

impl HandlerFailure {
    /// Converts the failure into the outcome recorded for pull-mode events.
    pub fn into_outcome(self) -> Outcome {
        Outcome::permanent("unexpected handler error").with_error(self.to_string())
    }
}

/// Calls `handler.handle`, isolating errors and panics.
pub async fn invoke_handler(handler: &dyn Handler, event: &Event) -> Result<Outcome, HandlerFailure> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(HandlerFailure::Error(err)),
        Err(panic) => Err(HandlerFailure::Panic(panic_message(panic.as_ref()))),
    }
}

/// Extracts the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocalStatus;

    #[derive(Debug)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    #[derive(Debug)]
    struct ScriptedHandler(Behavior);

    #[async_trait]
    impl Handler for ScriptedHandler {
        async fn handle(&self, event: &Event) -> anyhow::Result<Outcome> {
            match self.0 {
                Behavior::Succeed => Ok(Outcome::success_with_id(event.id.to_string())),
                Behavior::Fail => Err(anyhow::anyhow!("database is gone")),
                #[allow(clippy::panic)]
                Behavior::Panic => panic!("index out of bounds"),
            }
        }
    }

    #[tokio::test]
    async fn outcome_is_passed_through() {
        let handler = ScriptedHandler(Behavior::Succeed);
        let outcome = invoke_handler(&handler, &Event::new("e1")).await.expect("outcome");
        assert_eq!(outcome, Outcome::success_with_id("e1"));
    }

    #[tokio::test]
    async fn error_becomes_permanent_failure() {
        let handler = ScriptedHandler(Behavior::Fail);
        let failure = invoke_handler(&handler, &Event::new("e1")).await.expect_err("failure");

        let outcome = failure.into_outcome();
        assert_eq!(outcome.local_status(), LocalStatus::PermanentFailure);
        assert_eq!(outcome.message(), Some("unexpected handler error"));
        assert_eq!(outcome.error(), Some("database is gone"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let handler = ScriptedHandler(Behavior::Panic);
        let failure = invoke_handler(&handler, &Event::new("e1")).await.expect_err("failure");

        assert!(matches!(&failure, HandlerFailure::Panic(m) if m == "index out of bounds"));
        assert_eq!(failure.into_outcome().local_status(), LocalStatus::PermanentFailure);
    }

    #[tokio::test]
    async fn default_lifecycle_hooks_succeed() {
        let handler = ScriptedHandler(Behavior::Succeed);
        assert!(handler.init().await.is_ok());
        assert!(handler.sync().await.is_ok());
        assert!(handler.slow_sync().await.is_ok());
        assert!(handler.shutdown().await.is_ok());
    }
}
