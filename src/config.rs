//! Service configuration.

use std::{net::IpAddr, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use timepost_api::{ConnectorInfo, WebhookConfig};
use timepost_delivery::{ClientConfig, FetchConfig, RetryPolicy, MAX_BATCH_LIMIT};

use crate::controller::{ControllerConfig, RetentionPolicy, Schedule};

const CONFIG_FILE: &str = "timepost.toml";
const ENV_PREFIX: &str = "TIMEPOST_";

/// How events reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Pull events with the long-poll fetch client.
    LongPoll,
    /// Receive events pushed to the webhook server.
    Webhook,
    /// No transport; only the periodic runners.
    None,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `TIMEPOST_` (highest priority)
/// 2. Configuration file (`timepost.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active transport.
    pub transport: TransportMode,

    // Remote service
    /// Base URL of the remote time-event service.
    pub remote_base_url: String,
    /// Bearer token for the remote service.
    pub remote_api_token: Option<String>,
    /// Per-request timeout against the remote service.
    pub remote_timeout_seconds: u64,

    // Dedup store
    /// SQLite database URL.
    pub database_url: String,
    /// Maximum database connections in the pool.
    pub database_max_connections: u32,

    // Delivery
    /// Events per fetch, 1 to 25.
    pub batch_limit: usize,
    /// Key webhook callers must present, if any.
    pub caller_key: Option<String>,
    /// Background status reports in flight at once.
    pub max_concurrent_reports: usize,
    /// Downstream URL for the forwarding handler.
    pub forward_url: Option<String>,
    /// Timeout of one forwarded request.
    pub forward_timeout_seconds: u64,

    // Webhook server
    /// Webhook bind address.
    pub webhook_host: String,
    /// Webhook bind port.
    pub webhook_port: u16,
    /// Per-request timeout of the webhook server.
    pub webhook_request_timeout_seconds: u64,
    /// Name reported in `connectorInfo`.
    pub connector_name: String,

    // Scheduling
    /// Status report sweep period.
    pub status_sweep_seconds: u64,
    /// Primary sync period.
    pub sync_interval_seconds: u64,
    /// Slow sync period.
    pub slow_sync_interval_seconds: u64,
    /// Health sweep period.
    pub health_check_seconds: u64,
    /// Sustained unhealthiness before the service stops itself.
    pub unhealthy_threshold_minutes: u64,
    /// Bound on draining work at shutdown.
    pub shutdown_timeout_seconds: u64,
    /// Age after which reported records are purged. Unset keeps them forever.
    pub retention_days: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportMode::LongPoll,
            remote_base_url: "http://127.0.0.1:9090".to_string(),
            remote_api_token: None,
            remote_timeout_seconds: 30,
            database_url: "sqlite://timepost.db".to_string(),
            database_max_connections: 5,
            batch_limit: MAX_BATCH_LIMIT,
            caller_key: None,
            max_concurrent_reports: 4,
            forward_url: None,
            forward_timeout_seconds: 30,
            webhook_host: "0.0.0.0".to_string(),
            webhook_port: 8080,
            webhook_request_timeout_seconds: 30,
            connector_name: "timepost".to_string(),
            status_sweep_seconds: 30,
            sync_interval_seconds: 60,
            slow_sync_interval_seconds: 3600,
            health_check_seconds: 60,
            unhealthy_threshold_minutes: 10,
            shutdown_timeout_seconds: 30,
            retention_days: None,
        }
    }
}

impl Config {
    /// Loads `timepost.toml` from the working directory plus environment
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Loads a specific file plus environment overrides. A missing file is
    /// not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_LIMIT).contains(&self.batch_limit) {
            bail!("batch_limit must be between 1 and {MAX_BATCH_LIMIT}");
        }
        if self.database_url.trim().is_empty() {
            bail!("database_url must not be empty");
        }
        if self.database_max_connections == 0 {
            bail!("database_max_connections must be greater than 0");
        }
        if self.max_concurrent_reports == 0 {
            bail!("max_concurrent_reports must be greater than 0");
        }
        for (name, value) in [
            ("remote_timeout_seconds", self.remote_timeout_seconds),
            ("forward_timeout_seconds", self.forward_timeout_seconds),
            ("webhook_request_timeout_seconds", self.webhook_request_timeout_seconds),
            ("status_sweep_seconds", self.status_sweep_seconds),
            ("sync_interval_seconds", self.sync_interval_seconds),
            ("slow_sync_interval_seconds", self.slow_sync_interval_seconds),
            ("health_check_seconds", self.health_check_seconds),
            ("unhealthy_threshold_minutes", self.unhealthy_threshold_minutes),
            ("shutdown_timeout_seconds", self.shutdown_timeout_seconds),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }
        if self.retention_days == Some(0) {
            bail!("retention_days must be greater than 0 when set");
        }
        if self.transport == TransportMode::Webhook {
            self.webhook_ip()?;
        }
        Ok(())
    }

    /// Remote client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.remote_base_url.clone(),
            api_token: self.remote_api_token.clone(),
            timeout: Duration::from_secs(self.remote_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    fn unhealthy_threshold(&self) -> Duration {
        Duration::from_secs(self.unhealthy_threshold_minutes.saturating_mul(60))
    }

    /// Long-poll loop configuration.
    pub fn to_fetch_config(&self) -> FetchConfig {
        FetchConfig {
            batch_limit: self.batch_limit,
            retry_policy: RetryPolicy::fetch(),
            unhealthy_after: self.unhealthy_threshold(),
            ..FetchConfig::default()
        }
    }

    /// Webhook server configuration.
    pub fn to_webhook_config(&self) -> Result<WebhookConfig> {
        Ok(WebhookConfig {
            host: self.webhook_ip()?,
            port: self.webhook_port,
            request_timeout: Duration::from_secs(self.webhook_request_timeout_seconds),
            ..WebhookConfig::default()
        })
    }

    /// Identity reported in webhook responses.
    pub fn connector_info(&self) -> ConnectorInfo {
        ConnectorInfo { name: self.connector_name.clone(), ..ConnectorInfo::default() }
    }

    /// Runner schedules, health and shutdown bounds.
    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            status_sweep: Schedule::new(
                Duration::from_secs(5),
                Duration::from_secs(self.status_sweep_seconds),
            ),
            sync: Schedule::new(Duration::from_secs(5), Duration::from_secs(self.sync_interval_seconds)),
            slow_sync: Schedule::new(
                Duration::from_secs(30),
                Duration::from_secs(self.slow_sync_interval_seconds),
            ),
            retention: self.retention_days.map(|days| RetentionPolicy {
                max_age: Duration::from_secs(days.saturating_mul(24 * 3600)),
                ..RetentionPolicy::default()
            }),
            health_check_interval: Duration::from_secs(self.health_check_seconds),
            unhealthy_threshold: self.unhealthy_threshold(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    fn webhook_ip(&self) -> Result<IpAddr> {
        self.webhook_host
            .parse()
            .with_context(|| format!("invalid webhook_host {}", self.webhook_host))
    }
}
