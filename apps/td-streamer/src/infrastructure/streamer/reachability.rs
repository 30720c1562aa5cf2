//! Network Reachability
//!
//! Recovery waits for the network before reconnecting. Reachability is a
//! plain TCP connect to a well-known host with a short timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::application::ports::NetworkProbe;

/// Default probe target.
pub const DEFAULT_PROBE_ADDR: &str = "www.google.com:80";

/// Default connect timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP connect probe.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_ADDR, DEFAULT_PROBE_TIMEOUT)
    }
}

impl TcpProbe {
    /// Probe `addr` (`host:port`) with `timeout`.
    #[must_use]
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Target address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, error = %e, "Probe connect failed");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "Probe timed out");
                false
            }
        }
    }
}
