//! Test doubles and fixtures shared by the timepost crates.
//!
//! Provides a scripted [`RecordingHandler`], a [`MockRemoteClient`] standing
//! in for the remote service, and [`TestEnv`], which wires both to an
//! in-memory SQLite dedup store driven by a [`TestClock`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use serde_json::json;
use timepost_core::Event;
pub use timepost_core::TestClock;

mod env;
mod handler;
mod remote;

pub use env::TestEnv;
pub use handler::{RecordingHandler, Script};
pub use remote::MockRemoteClient;

/// A realistic posted-time event.
pub fn time_event(id: &str) -> Event {
    Event::new(id)
        .with_field("userId", json!("u-42"))
        .with_field("minutes", json!(45))
        .with_field("comment", json!("sprint planning"))
}
