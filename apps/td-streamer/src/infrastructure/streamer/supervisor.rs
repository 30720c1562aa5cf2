//! Reconnect Supervisor
//!
//! Runs after an unexpected close of a logged-in session. It waits for the
//! network to come back, re-runs the full connect sequence (credentials are
//! fetched again) and replays every active subscription. An explicit logout
//! or shutdown stops it at the next poll.
//!
//! The default delay between failed attempts is a flat two seconds with no
//! attempt cap. Exponential growth, jitter and a cap can be configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::NetworkProbe;
use crate::infrastructure::metrics;

use super::error::StreamError;

// =============================================================================
// Retry Policy
// =============================================================================

/// Delay policy between reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Growth factor per failure; `1.0` keeps the delay flat.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (`0.1` = ±10%).
    pub jitter_factor: f64,
    /// Retries after the first attempt (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2))
    }
}

impl ReconnectConfig {
    /// Flat delay, no jitter, no cap.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    /// Exponential backoff.
    #[must_use]
    pub const fn exponential(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }
}

/// Stateful delay sequence for one recovery.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Start a fresh sequence.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next retry, or `None` once the cap is reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u128
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Restart the sequence.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(adjusted_millis as u64)
    }
}

// =============================================================================
// Session Control
// =============================================================================

/// What the supervisor needs from the session it restores.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Whether the user logged out since the loss.
    fn user_logged_off(&self) -> bool;

    /// Whether the session is currently logged in.
    fn is_logged_in(&self) -> bool;

    /// Enter the recovering state.
    fn mark_recovering(&self);

    /// Open a new transport and log in.
    async fn reestablish(&self) -> Result<(), StreamError>;

    /// Re-issue SUBS for every active service; returns how many were sent.
    async fn replay_subscriptions(&self) -> Result<usize, StreamError>;
}

/// Signal sent by the session when a logged-in connection drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLost {
    /// Connection generation that dropped.
    pub generation: u64,
    /// Why it dropped.
    pub reason: String,
}

/// Result of one recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Logged in again and subscriptions replayed.
    Recovered {
        /// Connect attempts made, including the successful one.
        attempts: u32,
        /// Services replayed.
        replayed: usize,
    },
    /// The user logged out while recovering.
    LoggedOff,
    /// The supervisor was shut down.
    Cancelled,
    /// The configured attempt cap was reached.
    Exhausted {
        /// Connect attempts made.
        attempts: u32,
    },
}

/// Supervisor timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Pause between reachability probes.
    pub probe_interval: Duration,
    /// Delay policy between failed attempts.
    pub reconnect: ReconnectConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Restores lost sessions.
pub struct ReconnectSupervisor {
    session: Arc<dyn SessionControl>,
    probe: Arc<dyn NetworkProbe>,
    config: SupervisorConfig,
    cancel: CancellationToken,
}

impl ReconnectSupervisor {
    /// Create a supervisor for `session`.
    #[must_use]
    pub fn new(
        session: Arc<dyn SessionControl>,
        probe: Arc<dyn NetworkProbe>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            probe,
            config,
            cancel,
        }
    }

    /// Handle loss signals until cancelled or the sender is dropped.
    pub async fn run(self, mut lost_rx: mpsc::UnboundedReceiver<ConnectionLost>) {
        loop {
            let lost = tokio::select! {
                () = self.cancel.cancelled() => break,
                lost = lost_rx.recv() => match lost {
                    Some(lost) => lost,
                    None => break,
                },
            };

            tracing::warn!(
                generation = lost.generation,
                reason = %lost.reason,
                "Connection lost, starting recovery"
            );

            let outcome = self.recover().await;
            match outcome {
                RecoveryOutcome::Recovered { attempts, replayed } => {
                    tracing::info!(attempts, replayed, "Session recovered");
                    // Losses reported while recovering are already handled.
                    if self.session.is_logged_in() {
                        while lost_rx.try_recv().is_ok() {}
                    }
                }
                RecoveryOutcome::LoggedOff => tracing::info!("Recovery abandoned after logout"),
                RecoveryOutcome::Cancelled => break,
                RecoveryOutcome::Exhausted { attempts } => {
                    tracing::error!(attempts, "Giving up on reconnection");
                }
            }
        }
        tracing::debug!("Reconnect supervisor stopped");
    }

    /// Recover one lost session.
    pub async fn recover(&self) -> RecoveryOutcome {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut attempts = 0_u32;
        self.session.mark_recovering();

        loop {
            if self.cancel.is_cancelled() {
                return RecoveryOutcome::Cancelled;
            }
            if self.session.user_logged_off() {
                return RecoveryOutcome::LoggedOff;
            }

            if !self.probe.is_reachable().await {
                tracing::debug!("Network unreachable, waiting");
                if !self.pause(self.config.probe_interval).await {
                    return RecoveryOutcome::Cancelled;
                }
                continue;
            }

            attempts += 1;
            metrics::record_reconnect();
            tracing::info!(attempt = attempts, "Reconnecting");

            match self.attempt().await {
                Ok(replayed) => return RecoveryOutcome::Recovered { attempts, replayed },
                Err(e) => {
                    metrics::record_websocket_error(e.kind());
                    tracing::warn!(attempt = attempts, error = %e, "Reconnect attempt failed");
                }
            }

            let Some(delay) = policy.next_delay() else {
                return RecoveryOutcome::Exhausted { attempts };
            };
            tracing::debug!(attempt = attempts, delay_ms = delay.as_millis(), "Retrying after delay");
            if !self.pause(delay).await {
                return RecoveryOutcome::Cancelled;
            }
        }
    }

    async fn attempt(&self) -> Result<usize, StreamError> {
        self.session.reestablish().await?;
        self.session.replay_subscriptions().await
    }

    /// Sleep unless cancelled first; returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
