//! Application Layer - Port definitions and observer fan-out.
//!
//! Ports describe what the streaming core consumes from the outside world
//! (credentials, reachability, durable storage); services hold the
//! use-case level plumbing shared by infrastructure adapters.

/// Port interfaces for external systems.
pub mod ports;

/// Observer registration and notification.
pub mod services;
