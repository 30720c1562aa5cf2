//! Streamer Configuration Settings
//!
//! Configuration types for the streamer, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::service::{QosLevel, Service};
use crate::domain::subscription::Key;
use crate::infrastructure::credentials::DEFAULT_API_BASE_URL;
use crate::infrastructure::streamer::heartbeat::HeartbeatConfig;
use crate::infrastructure::streamer::reachability::{DEFAULT_PROBE_ADDR, DEFAULT_PROBE_TIMEOUT};
use crate::infrastructure::streamer::supervisor::{ReconnectConfig, SupervisorConfig};

/// OAuth credentials for the REST API.
#[derive(Clone)]
pub struct ApiCredentials {
    client_id: String,
    refresh_token: String,
}

impl ApiCredentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(client_id: String, refresh_token: String) -> Self {
        Self {
            client_id,
            refresh_token,
        }
    }

    /// OAuth client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Long-lived refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// Session and transport settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Wait for the LOGIN response (`None` = no limit).
    pub login_timeout: Option<Duration>,
    /// WebSocket ping interval.
    pub heartbeat_interval: Duration,
    /// Time after a ping before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// QoS level requested after login.
    pub qos: QosLevel,
    /// Reference UTC offset for timestamp adjustment.
    pub reference_utc_offset_hours: i32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let heartbeat = HeartbeatConfig::default();
        Self {
            login_timeout: Some(Duration::from_secs(30)),
            heartbeat_interval: heartbeat.ping_interval,
            heartbeat_timeout: heartbeat.timeout,
            qos: QosLevel::default(),
            reference_utc_offset_hours: -5,
        }
    }
}

/// Reachability and reconnection settings.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// `host:port` dialed to test reachability.
    pub probe_addr: String,
    /// Connect timeout of one probe.
    pub probe_timeout: Duration,
    /// Pause between probes while unreachable.
    pub probe_interval: Duration,
    /// Delay policy between failed reconnects.
    pub reconnect: ReconnectConfig,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            probe_addr: DEFAULT_PROBE_ADDR.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_interval: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RecoverySettings {
    /// Supervisor timing derived from these settings.
    #[must_use]
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            probe_interval: self.probe_interval,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Write buffered records to CSV files.
    pub cache_enabled: bool,
    /// Directory for the CSV files.
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            data_dir: PathBuf::from("./StreamData"),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// REST base URL.
    pub api_base_url: String,
    /// OAuth credentials.
    pub credentials: ApiCredentials,
    /// Account to stream for; the first listed account when unset.
    pub account_id: Option<String>,
    /// Session and transport settings.
    pub session: SessionSettings,
    /// Reachability and reconnection settings.
    pub recovery: RecoverySettings,
    /// Persistence settings.
    pub storage: StorageSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Subscriptions applied after the first login.
    pub subscriptions: Vec<(Service, Vec<Key>)>,
}

impl StreamerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id = required_env("TD_CLIENT_ID")?;
        let refresh_token = required_env("TD_REFRESH_TOKEN")?;

        let api_base_url =
            std::env::var("TD_API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());

        let account_id = std::env::var("TD_ACCOUNT_ID")
            .ok()
            .filter(|id| !id.is_empty());

        let session_defaults = SessionSettings::default();
        let login_timeout_secs = parse_env_u64(
            "TD_LOGIN_TIMEOUT_SECS",
            session_defaults.login_timeout.map_or(0, |t| t.as_secs()),
        );
        let session = SessionSettings {
            login_timeout: (login_timeout_secs > 0).then(|| Duration::from_secs(login_timeout_secs)),
            heartbeat_interval: parse_env_duration_secs(
                "TD_HEARTBEAT_INTERVAL_SECS",
                session_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                "TD_HEARTBEAT_TIMEOUT_SECS",
                session_defaults.heartbeat_timeout,
            ),
            qos: std::env::var("TD_QOS_LEVEL")
                .ok()
                .and_then(|v| v.parse::<u8>().ok())
                .and_then(QosLevel::from_code)
                .unwrap_or(session_defaults.qos),
            reference_utc_offset_hours: parse_env_i32(
                "TD_SESSION_UTC_OFFSET_HOURS",
                session_defaults.reference_utc_offset_hours,
            ),
        };

        let recovery_defaults = RecoverySettings::default();
        let reconnect_defaults = recovery_defaults.reconnect.clone();
        let recovery = RecoverySettings {
            probe_addr: std::env::var("TD_PROBE_ADDR").unwrap_or(recovery_defaults.probe_addr),
            probe_timeout: parse_env_duration_millis(
                "TD_PROBE_TIMEOUT_MS",
                recovery_defaults.probe_timeout,
            ),
            probe_interval: parse_env_duration_millis(
                "TD_PROBE_INTERVAL_MS",
                recovery_defaults.probe_interval,
            ),
            reconnect: ReconnectConfig {
                initial_delay: parse_env_duration_millis(
                    "TD_RECONNECT_DELAY_INITIAL_MS",
                    reconnect_defaults.initial_delay,
                ),
                max_delay: parse_env_duration_millis(
                    "TD_RECONNECT_DELAY_MAX_MS",
                    reconnect_defaults.max_delay,
                ),
                multiplier: parse_env_f64(
                    "TD_RECONNECT_DELAY_MULTIPLIER",
                    reconnect_defaults.multiplier,
                ),
                jitter_factor: parse_env_f64(
                    "TD_RECONNECT_JITTER_FACTOR",
                    reconnect_defaults.jitter_factor,
                ),
                max_attempts: parse_env_u32(
                    "TD_RECONNECT_MAX_ATTEMPTS",
                    reconnect_defaults.max_attempts,
                ),
            },
        };

        let storage_defaults = StorageSettings::default();
        let storage = StorageSettings {
            cache_enabled: parse_env_bool("TD_CACHE_ENABLED", storage_defaults.cache_enabled),
            data_dir: std::env::var("TD_DATA_DIR")
                .map_or(storage_defaults.data_dir, PathBuf::from),
        };

        let server = ServerSettings {
            health_port: parse_env_u16("TD_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let subscriptions = std::env::var("TD_SUBSCRIPTIONS")
            .map(|raw| parse_subscriptions(&raw))
            .unwrap_or_default();

        Ok(Self {
            api_base_url,
            credentials: ApiCredentials::new(client_id, refresh_token),
            account_id,
            session,
            recovery,
            storage,
            server,
            subscriptions,
        })
    }

    /// Heartbeat settings for the client.
    #[must_use]
    pub const fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(
            self.session.heartbeat_interval,
            self.session.heartbeat_timeout,
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

/// Parse `CHART_EQUITY=SPY,AAPL;TIMESALE_EQUITY=SPY`.
///
/// Malformed groups and empty key lists are skipped.
#[must_use]
pub fn parse_subscriptions(raw: &str) -> Vec<(Service, Vec<Key>)> {
    raw.split(';')
        .filter_map(|group| {
            let (service, keys) = group.split_once('=')?;
            let service = service.trim();
            let keys: Vec<Key> = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string)
                .collect();
            if service.is_empty() || keys.is_empty() {
                tracing::warn!(group, "Ignoring malformed subscription group");
                return None;
            }
            Some((Service::from_wire(service), keys))
        })
        .collect()
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    let value = std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map_or(default, |v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_groups() {
        let parsed = parse_subscriptions("CHART_EQUITY=SPY, AAPL;TIMESALE_EQUITY=SPY");
        assert_eq!(
            parsed,
            vec![
                (
                    Service::ChartEquity,
                    vec!["SPY".to_string(), "AAPL".to_string()]
                ),
                (Service::TimesaleEquity, vec!["SPY".to_string()]),
            ]
        );
    }

    #[test]
    fn malformed_subscription_groups_are_skipped() {
        let parsed = parse_subscriptions("QUOTE;=SPY;NASDAQ_BOOK=;;LEVELONE_FUTURES=/ES");
        assert_eq!(
            parsed,
            vec![(Service::LeveloneFutures, vec!["/ES".to_string()])]
        );
        assert!(parse_subscriptions("").is_empty());
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = ApiCredentials::new("CLIENT@AMER.OAUTHAP".to_string(), "secret456".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn session_settings_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.login_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.qos, QosLevel::Fast);
        assert_eq!(settings.reference_utc_offset_hours, -5);
    }

    #[test]
    fn recovery_settings_defaults() {
        let settings = RecoverySettings::default();
        assert_eq!(settings.probe_addr, "www.google.com:80");
        assert_eq!(settings.probe_interval, Duration::from_secs(2));
        assert_eq!(settings.supervisor().reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(settings.reconnect.max_attempts, 0);
    }

    #[test]
    fn storage_and_server_defaults() {
        assert!(StorageSettings::default().cache_enabled);
        assert_eq!(StorageSettings::default().data_dir, PathBuf::from("./StreamData"));
        assert_eq!(ServerSettings::default().health_port, 8083);
    }
}
