//! Streaming client errors.

use std::time::Duration;

use crate::application::ports::CredentialError;

use super::codec::CodecError;

/// Errors surfaced to callers of the streaming client.
///
/// Only credential, transport-open and login failures reach `connect()`
/// callers. Frame-level problems and sequence gaps are handled inside the
/// receive loop and never unwind.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Credentials could not be obtained or refreshed.
    #[error("authentication failed: {0}")]
    Auth(#[from] CredentialError),

    /// The server answered LOGIN with a non-zero code.
    #[error("login rejected (code {code}): {message}")]
    LoginRejected {
        /// Server response code.
        code: i64,
        /// Server response message.
        message: String,
    },

    /// WebSocket open, send or receive failed.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// No LOGIN response arrived in time.
    #[error("no login response within {0:?}")]
    LoginTimeout(Duration),

    /// The connection closed before the operation completed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client has been shut down.
    #[error("client is shut down")]
    Shutdown,
}

impl StreamError {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::LoginRejected { .. } => "login_rejected",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::LoginTimeout(_) => "login_timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether another connect attempt can succeed without operator action.
    ///
    /// Credential and login rejections repeat on every attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Protocol(_) | Self::LoginTimeout(_) | Self::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_rejected_message() {
        let err = StreamError::LoginRejected {
            code: 3,
            message: "Login Denied".to_string(),
        };
        assert_eq!(err.to_string(), "login rejected (code 3): Login Denied");
        assert_eq!(err.kind(), "login_rejected");
    }

    #[test]
    fn credential_errors_convert() {
        let err: StreamError = CredentialError::RefreshFailed {
            message: "expired".to_string(),
        }
        .into();
        assert!(matches!(err, StreamError::Auth(_)));
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        let rejected = StreamError::LoginRejected {
            code: 3,
            message: "Login Denied".to_string(),
        };
        let auth: StreamError = CredentialError::RefreshFailed {
            message: "invalid_grant".to_string(),
        }
        .into();

        assert!(!rejected.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!StreamError::Shutdown.is_retryable());
        assert!(StreamError::LoginTimeout(Duration::from_secs(5)).is_retryable());
        assert!(StreamError::ConnectionClosed.is_retryable());
        assert!(
            StreamError::Transport(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
                .is_retryable()
        );
    }
}
