//! Download Rate
//!
//! Counts inbound payload bytes and publishes a bytes-per-second figure
//! once per second while the session is logged in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics;

/// Sampling period.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Byte counter with a one-second sample.
#[derive(Debug, Default)]
pub struct DownloadRate {
    window: AtomicU64,
    last_sample: AtomicU64,
}

impl DownloadRate {
    /// Create an idle counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `bytes` received.
    pub fn add(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.window.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_bytes_received(bytes);
    }

    /// Close the current window and return its byte count.
    pub fn sample(&self) -> u64 {
        let bytes = self.window.swap(0, Ordering::Relaxed);
        self.last_sample.store(bytes, Ordering::Relaxed);
        metrics::set_download_rate(bytes);
        bytes
    }

    /// Bytes received during the last full window.
    #[must_use]
    pub fn bytes_per_second(&self) -> u64 {
        self.last_sample.load(Ordering::Relaxed)
    }

    /// Sample every second until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Download rate sampler stopped");
                    break;
                }
                _ = interval.tick() => {
                    let bytes = self.sample();
                    tracing::trace!(bytes_per_second = bytes, "Download rate");
                }
            }
        }
        self.last_sample.store(0, Ordering::Relaxed);
    }
}
