#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation
    )
)]

//! TD Streamer - Brokerage Streaming Client
//!
//! Maintains one authenticated WebSocket session against the brokerage
//! streamer, keeps a registry of subscriptions that survives reconnects,
//! checks per-key sequence continuity and turns data frames into typed
//! records that are buffered and persisted to per-day CSV files.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure bookkeeping
//!   - `service`: Service catalogue, commands, QoS levels
//!   - `subscription`: Subscription registry and sequence cursors
//!   - `sequence`: Gap detection
//!   - `records`: Typed records and per-service buffers
//!   - `session`: Session state and streaming credentials
//!   - `time`: Session clock
//!
//! - **Application**: Port definitions and observer fan-out
//!   - `ports`: Credential supplier, network probe, record sink
//!   - `services`: Observer registry
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `streamer`: WebSocket session, protocol, dispatcher, supervisor
//!   - `credentials`: OAuth credential supplier
//!   - `persistence`: CSV sink and cache flusher
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! WebSocket ──► Dispatcher ──► Segregator ──► RecordBuffer ──► CacheFlusher ──► CSV
//!                   │              │
//!                   │              └──► GapDetector ──► MissSequence / QOS probe
//!                   └──► LOGIN / QOS responses, notices, snapshots
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Port definitions and observers.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::records::{DataRecord, RecordBuffer};
pub use domain::sequence::{GapDetector, GapSeverity, SequenceCheck, SequenceGap};
pub use domain::service::{Command, QosLevel, Service, ServiceFamily};
pub use domain::session::{SessionState, StreamingCredentials};
pub use domain::subscription::{
    AppliedCommand, Key, Sequence, Subscription, SubscriptionCommand, SubscriptionRegistry,
};
pub use domain::time::SessionClock;

// Ports and observers
pub use application::ports::{
    AlwaysReachable, CredentialError, CredentialSupplier, NetworkProbe, RecordSink, SharedSink,
    SinkError,
};
pub use application::services::{MISS_SEQUENCE, ObserverRegistry, StreamNotification};

// Streaming client
pub use infrastructure::streamer::{
    ChartHistoryQuery, ClientConfig, StreamError, StreamingClient, TcpProbe,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, StreamerConfig};

// Credentials and persistence
pub use infrastructure::credentials::HttpCredentialSupplier;
pub use infrastructure::persistence::{CacheFlusher, CsvSink};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
