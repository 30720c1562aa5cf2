//! Session State
//!
//! ```text
//! DISCONNECTED → CONNECTING → AWAITING_LOGIN_ACK → LOGGED_IN
//!                    ▲                                 │
//!                    │                    clean logout │ unexpected close
//!                    │                         ▼       ▼
//!                    └──── reachable ──── RECOVERING   DISCONNECTED
//! ```

use std::fmt;

/// Lifecycle state of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Fetching credentials and opening the socket.
    Connecting,
    /// LOGIN sent, waiting for its response.
    AwaitingLoginAck,
    /// LOGIN accepted.
    LoggedIn,
    /// Connection lost unexpectedly; waiting for the network to return.
    Recovering,
}

impl SessionState {
    /// Label used in logs, metrics and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingLoginAck => "awaiting_login_ack",
            Self::LoggedIn => "logged_in",
            Self::Recovering => "recovering",
        }
    }

    /// Whether commands can be sent without connecting first.
    #[must_use]
    pub const fn is_logged_in(self) -> bool {
        matches!(self, Self::LoggedIn)
    }

    /// Numeric code exported as a gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::AwaitingLoginAck => 2,
            Self::LoggedIn => 3,
            Self::Recovering => 4,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session connection parameters issued by the brokerage.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamingCredentials {
    /// Account id used as `userid` and as the request `account`.
    pub user_id: String,
    /// Streamer session token.
    pub token: String,
    /// Account company code.
    pub company: String,
    /// Account segment.
    pub segment: String,
    /// Account CD domain id.
    pub cd_domain: String,
    /// Streamer user group.
    pub user_group: String,
    /// Streamer access level.
    pub access_level: String,
    /// Application id used as the request `source`.
    pub app_id: String,
    /// Entitlement ACL string.
    pub acl: String,
    /// Token issue time, epoch milliseconds.
    pub token_timestamp_ms: i64,
    /// WebSocket endpoint, e.g. `wss://streamer-ws.example.com/ws`.
    pub socket_url: String,
    /// Key used to subscribe to account activity.
    pub subscription_key: String,
}

impl fmt::Debug for StreamingCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingCredentials")
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .field("app_id", &self.app_id)
            .field("socket_url", &self.socket_url)
            .field("subscription_key", &"[REDACTED]")
            .field("token_timestamp_ms", &self.token_timestamp_ms)
            .finish_non_exhaustive()
    }
}
