//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the streamer protocol itself.

/// Streamer WebSocket session, protocol and recovery.
pub mod streamer;

/// OAuth credential supplier over the REST API.
pub mod credentials;

/// CSV persistence sink and cache flusher.
pub mod persistence;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
