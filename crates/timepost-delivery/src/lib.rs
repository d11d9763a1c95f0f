//! Long-poll delivery and status reporting for posted time events.
//!
//! This crate holds everything that talks to the remote time-event service:
//! the HTTP [`client::HttpRemoteClient`], the [`fetch::FetchClient`]
//! long-poll transport with its single-slot handler worker, and the
//! [`reporter::StatusReporter`] that pushes local outcomes back.
//!
//! # Pull-mode flow
//!
//! 1. **Fetch** - pull up to 25 events, backing off on transient failures
//! 2. **Partition** - events already resolved locally are only re-reported
//! 3. **Dispatch** - the rest are marked in progress and queued
//! 4. **Handle** - the worker invokes the handler one event at a time
//! 5. **Report** - outcomes are persisted and reported in the background
//!
//! Anything that fails to report stays pending in the dedup store until the
//! periodic sweep gets it through.

pub mod client;
pub mod error;
pub mod fetch;
pub mod forward;
pub mod remote;
pub mod reporter;
pub mod retry;
pub mod stats;
mod worker;

pub use client::{ClientConfig, HttpRemoteClient};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use fetch::{DispatchSummary, FetchClient, FetchConfig, MAX_BATCH_LIMIT};
pub use forward::ForwardingHandler;
pub use remote::{RemoteClient, RemoteStatus, StatusReport};
pub use reporter::{StatusReporter, SweepSummary, DEFAULT_MAX_CONCURRENT_REPORTS};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use stats::{DeliveryStats, SharedStats};
