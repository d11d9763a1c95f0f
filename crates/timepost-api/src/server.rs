//! Webhook HTTP server and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! The server runs as a [`Transport`]: `start` binds and serves in the
//! background, `stop` stops accepting connections and waits for in-flight
//! requests up to the given timeout.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use timepost_core::{CoreError, Transport};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{handlers, AppState};

/// Listener and timeouts of the webhook server.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Interface to bind.
    pub host: IpAddr,
    /// Port to bind, 0 for an ephemeral port.
    pub port: u16,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Timeout of the `/ping` self-probe behind `is_healthy`.
    pub probe_timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl WebhookConfig {
    /// Address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Creates the router with all routes and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let probe_routes = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/metric", get(handlers::metric))
        .route("/health", get(handlers::health_check));

    let event_routes =
        Router::new().route("/receiveTimePostedEvent", post(handlers::receive_time_posted_event));

    Router::new()
        .merge(probe_routes)
        .merge(event_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }
    response
}

/// Push-mode transport serving the webhook routes.
pub struct WebhookServer {
    config: WebhookConfig,
    state: AppState,
    probe: reqwest::Client,
    cancellation_token: CancellationToken,
    running: Arc<AtomicBool>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    serve_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebhookServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl WebhookServer {
    /// Creates a stopped server.
    pub fn new(config: WebhookConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            probe: reqwest::Client::new(),
            cancellation_token: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: std::sync::Mutex::new(None),
            serve_handle: Mutex::new(None),
        }
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    fn probe_url(&self) -> Option<String> {
        let mut addr = self.local_addr()?;
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        Some(format!("http://{addr}/ping"))
    }
}

#[async_trait]
impl Transport for WebhookServer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn start(&self) -> timepost_core::Result<()> {
        let mut serve_handle = self.serve_handle.lock().await;
        if serve_handle.is_some() {
            warn!("webhook server already started");
            return Ok(());
        }
        if self.cancellation_token.is_cancelled() {
            return Err(CoreError::transport("webhook server was stopped and cannot restart"));
        }

        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::transport(format!("failed to bind {addr}: {e}")))?;
        let actual_addr = listener
            .local_addr()
            .map_err(|e| CoreError::transport(format!("failed to read local address: {e}")))?;
        if let Ok(mut slot) = self.local_addr.lock() {
            *slot = Some(actual_addr);
        }
        info!(%actual_addr, "webhook server listening");

        let app = create_router(self.state.clone(), self.config.request_timeout);
        let token = self.cancellation_token.clone();
        let running = self.running.clone();
        running.store(true, Ordering::Release);

        *serve_handle = Some(tokio::spawn(async move {
            let result =
                axum::serve(listener, app).with_graceful_shutdown(token.cancelled_owned()).await;
            if let Err(e) = result {
                error!(error = %e, "webhook server failed");
            }
            running.store(false, Ordering::Release);
            info!("webhook server stopped");
        }));
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn stop(&self, timeout: Duration) -> timepost_core::Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "stopping webhook server");
        self.cancellation_token.cancel();

        let Some(mut handle) = self.serve_handle.lock().await.take() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "webhook server task terminated abnormally");
                self.running.store(false, Ordering::Release);
                Ok(())
            },
            Err(_) => {
                warn!("webhook requests still running at shutdown");
                handle.abort();
                self.running.store(false, Ordering::Release);
                Err(CoreError::ShutdownTimeout { timeout })
            },
        }
    }

    async fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(url) = self.probe_url() else {
            return false;
        };
        match self.probe.get(&url).timeout(self.config.probe_timeout).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "webhook self-probe returned an error");
                false
            },
            Err(e) => {
                debug!(error = %e, "webhook self-probe failed");
                false
            },
        }
    }
}
