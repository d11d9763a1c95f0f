//! Core domain types and primitives for exactly-once time event delivery.
//!
//! Everything the delivery transports share lives here: the event and outcome
//! model, the persistent deduplication store, the user-facing handler
//! contract, and the scheduling and health primitives the controller wires
//! together. Transport crates depend on these types and never on each other.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handler;
pub mod health;
pub mod inflight;
pub mod models;
pub mod runner;
pub mod storage;
pub mod time;
pub mod transport;

pub use error::{CoreError, Result};
pub use handler::{invoke_handler, panic_message, Handler, HandlerFailure};
pub use health::{HealthAggregator, HealthProvider, HealthReport, RunnerHealth, ShutdownCallback};
pub use inflight::{InFlight, InFlightGuard};
pub use models::{DeliveryRecord, Event, EventId, LocalStatus, Outcome};
pub use runner::{RunOutcome, Runner, RunnerAction};
pub use storage::{DedupStore, InMemoryDedupStore, SqliteDedupStore};
pub use time::{Clock, RealClock, TestClock};
pub use transport::{Transport, TransportHealth};
