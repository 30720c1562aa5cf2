//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (ready while logged in)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::session::SessionState;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::streamer::StreamingClient;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Streamer version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Streaming session status.
    pub session: SessionStatus,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Logged in.
    Healthy,
    /// Connecting or recovering.
    Degraded,
    /// No session.
    Unhealthy,
}

/// Streaming session status.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Session state name.
    pub state: &'static str,
    /// Whether LOGIN has been accepted.
    pub logged_in: bool,
    /// Round trip of the last QOS request in milliseconds.
    pub last_ping_rtt_ms: Option<u64>,
    /// Server time of the last heartbeat notice.
    pub last_heartbeat: Option<i64>,
    /// Inbound bytes during the last second.
    pub download_bytes_per_second: u64,
}

/// Subscription statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    /// Active services.
    pub active_services: usize,
    /// Subscribed keys across active services.
    pub total_keys: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    client: StreamingClient,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, client: StreamingClient) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            client,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.client.state().is_logged_in() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let client = &state.client;
    let session_state = client.state();
    let stats = client.registry().stats();

    HealthResponse {
        status: determine_health_status(session_state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        session: SessionStatus {
            state: session_state.as_str(),
            logged_in: session_state.is_logged_in(),
            last_ping_rtt_ms: client
                .last_ping_rtt()
                .map(|rtt| u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX)),
            last_heartbeat: client.last_heartbeat(),
            download_bytes_per_second: client.download_rate(),
        },
        subscriptions: SubscriptionStatus {
            active_services: stats.active_services,
            total_keys: stats.total_keys,
        },
    }
}

const fn determine_health_status(state: SessionState) -> HealthStatus {
    match state {
        SessionState::LoggedIn => HealthStatus::Healthy,
        SessionState::Connecting | SessionState::AwaitingLoginAck | SessionState::Recovering => {
            HealthStatus::Degraded
        }
        SessionState::Disconnected => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use test_case::test_case;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{AlwaysReachable, MockCredentialSupplier};
    use crate::infrastructure::streamer::ClientConfig;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(SessionState::LoggedIn, HealthStatus::Healthy)]
    #[test_case(SessionState::Connecting, HealthStatus::Degraded)]
    #[test_case(SessionState::AwaitingLoginAck, HealthStatus::Degraded)]
    #[test_case(SessionState::Recovering, HealthStatus::Degraded)]
    #[test_case(SessionState::Disconnected, HealthStatus::Unhealthy)]
    fn status_follows_session(state: SessionState, expected: HealthStatus) {
        assert_eq!(determine_health_status(state), expected);
    }

    fn idle_state() -> HealthServerState {
        let client = StreamingClient::new(
            Arc::new(MockCredentialSupplier::new()),
            Arc::new(AlwaysReachable),
            None,
            ClientConfig::default(),
        );
        HealthServerState::new("0.1.0".to_string(), client)
    }

    async fn status_of(uri: &str) -> StatusCode {
        let app = router(Arc::new(idle_state()));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn probes_without_session() {
        assert_eq!(status_of("/healthz").await, StatusCode::OK);
        assert_eq!(status_of("/readyz").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_of("/health").await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn fresh_client_reports_unhealthy() {
        let state = idle_state();

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.session.state, "disconnected");
        assert!(!response.session.logged_in);
        assert_eq!(response.subscriptions.total_keys, 0);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["session"]["download_bytes_per_second"], 0);
    }
}
