//! HTTP handlers for the webhook routes.

pub mod health;
pub mod receive;

pub use health::{health_check, metric, ping};
pub use receive::receive_time_posted_event;
