//! Port Interfaces
//!
//! Driven ports the streaming core depends on. Infrastructure provides the
//! real adapters; tests substitute fakes or mocks.
//!
//! - `CredentialSupplier`: bearer token and per-session streamer credentials
//! - `NetworkProbe`: cheap outbound reachability check
//! - `RecordSink`: durable per-service, per-day record storage

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::domain::records::DataRecord;
use crate::domain::service::Service;
use crate::domain::session::StreamingCredentials;

// =============================================================================
// Credential Supplier
// =============================================================================

/// Credential supplier error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// The refresh grant was refused or could not be performed.
    #[error("token refresh failed: {message}")]
    RefreshFailed {
        /// Details.
        message: String,
    },

    /// The credentials endpoint could not be reached.
    #[error("credential request failed: {message}")]
    RequestFailed {
        /// Details.
        message: String,
    },

    /// The credentials endpoint answered with an unusable body.
    #[error("invalid credential response: {message}")]
    InvalidResponse {
        /// Details.
        message: String,
    },
}

/// Supplies a valid bearer token and streamer connection parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    /// Fetch fresh streamer credentials; they may change between sessions.
    async fn streaming_credentials(&self) -> Result<StreamingCredentials, CredentialError>;

    /// Current bearer token, refreshed transparently when close to expiry.
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

// =============================================================================
// Network Probe
// =============================================================================

/// Reachability check used while recovering a lost connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Whether an outbound connection to a known host succeeds.
    async fn is_reachable(&self) -> bool;
}

/// Probe that always reports the network as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl NetworkProbe for AlwaysReachable {
    async fn is_reachable(&self) -> bool {
        true
    }
}

// =============================================================================
// Record Sink
// =============================================================================

/// Record sink error.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying I/O failed.
    #[error("sink I/O error for {service}: {source}")]
    Io {
        /// Service being written.
        service: String,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// Record encoding failed.
    #[error("sink encoding error for {service}: {message}")]
    Encode {
        /// Service being written.
        service: String,
        /// Details.
        message: String,
    },

    /// Append or rotate on a service that has no open output.
    #[error("no open output for {service}")]
    NotOpen {
        /// Service.
        service: String,
    },
}

/// Durable storage for drained records, one output per service and day.
pub trait RecordSink: Send {
    /// Open the output for `service` on `day`, creating it if new.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if the output cannot be created or opened.
    fn open(&mut self, service: &Service, day: NaiveDate) -> Result<(), SinkError>;

    /// Append records to the open output for `service`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::NotOpen` if `service` has no open output.
    fn append(&mut self, service: &Service, records: &[DataRecord]) -> Result<(), SinkError>;

    /// Close the current output for `service` and open the one for `day`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if the new output cannot be opened.
    fn rotate(&mut self, service: &Service, day: NaiveDate) -> Result<(), SinkError>;

    /// Flush and close the output for `service`.
    ///
    /// # Errors
    ///
    /// Returns `SinkError` if flushing fails.
    fn close(&mut self, service: &Service) -> Result<(), SinkError>;

    /// Services with an open output.
    fn open_services(&self) -> Vec<Service>;

    /// Whether `service` has an open output.
    fn is_open(&self, service: &Service) -> bool {
        self.open_services().contains(service)
    }
}

/// Sink shared between the flusher and the session owner.
pub type SharedSink = Arc<Mutex<dyn RecordSink>>;
