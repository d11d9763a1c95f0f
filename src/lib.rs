//! Service wiring for timepost.
//!
//! The library half of the binary: configuration loading, the
//! [`controller::Controller`] that owns the lifecycle, and the default
//! [`handler::LoggingHandler`] used when no forward target is configured.

#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod handler;

pub use config::{Config, TransportMode};
pub use controller::{
    Components, Controller, ControllerConfig, HaltHook, LifecycleState, RetentionPolicy, Schedule,
};
pub use handler::LoggingHandler;
