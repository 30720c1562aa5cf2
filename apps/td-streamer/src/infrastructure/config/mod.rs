//! Configuration Module
//!
//! Configuration loading for the streamer binary.

mod settings;

pub use settings::{
    ApiCredentials, ConfigError, RecoverySettings, ServerSettings, SessionSettings,
    StorageSettings, StreamerConfig, parse_subscriptions,
};
