//! Domain Layer - Core streaming types.
//!
//! Pure bookkeeping for the streamer session: which feeds exist, what is
//! subscribed, how sequence continuity is judged, and the records that
//! segregated data turns into. Nothing here performs I/O.

/// Service catalogue, wire commands and QoS levels.
pub mod service;

/// Subscription registry and sequence cursors.
pub mod subscription;

/// Per-key sequence continuity checks.
pub mod sequence;

/// Normalized per-service data records and their buffers.
pub mod records;

/// Session state machine and streaming credentials.
pub mod session;

/// Session clock with the fixed UTC offset adjustment.
pub mod time;
