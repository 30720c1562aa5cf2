//! Heartbeat Monitor
//!
//! The streamer pushes a heartbeat notice every few seconds, so any inbound
//! frame proves the connection alive. When the socket stays quiet for a
//! full ping interval a WebSocket ping is requested; if nothing arrives
//! within the timeout after that, the connection is declared dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Quiet period after which a ping is sent.
    pub ping_interval: Duration,
    /// Quiet period after a ping before the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(20),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a ping message.
    SendPing,
    /// The connection has been silent too long.
    Timeout,
}

/// Activity bookkeeping shared with the receive loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    ping_outstanding: AtomicBool,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            ping_outstanding: AtomicBool::new(false),
        }
    }

    /// Record any inbound frame.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.ping_outstanding.store(false, Ordering::SeqCst);
    }

    /// Mark that a ping went out.
    pub fn mark_ping_sent(&self) {
        self.ping_outstanding.store(true, Ordering::SeqCst);
    }

    /// Whether a ping is waiting for any reply.
    #[must_use]
    pub fn is_ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Decide what the current idle time calls for.
    #[must_use]
    pub fn evaluate(&self, config: &HeartbeatConfig) -> Option<HeartbeatEvent> {
        let idle = self.idle_for();
        if self.is_ping_outstanding() {
            return (idle > config.ping_interval + config.timeout).then_some(HeartbeatEvent::Timeout);
        }
        (idle >= config.ping_interval).then_some(HeartbeatEvent::SendPing)
    }
}

/// Periodic checker feeding [`HeartbeatEvent`]s to the connection task.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the channel closes or a timeout is reported.
    pub async fn run(self) {
        let period = (self.config.ping_interval / 4).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let Some(event) = self.state.evaluate(&self.config) else {
                        continue;
                    };
                    if event == HeartbeatEvent::Timeout {
                        tracing::warn!(
                            idle_secs = self.state.idle_for().as_secs(),
                            "Heartbeat timeout detected"
                        );
                    } else {
                        self.state.mark_ping_sent();
                    }
                    if self.event_tx.send(event).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                    if event == HeartbeatEvent::Timeout {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ms: u64) -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_millis(ms), Duration::from_millis(ms))
    }

    #[test]
    fn default_config() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.timeout, Duration::from_secs(20));
    }

    #[test]
    fn fresh_state_is_quiet() {
        let state = HeartbeatState::new();
        assert_eq!(state.evaluate(&HeartbeatConfig::default()), None);
        assert!(!state.is_ping_outstanding());
    }

    #[test]
    fn idle_connection_gets_pinged_then_times_out() {
        let state = HeartbeatState::new();
        let config = config(0);
        std::thread::sleep(Duration::from_millis(2));

        assert_eq!(state.evaluate(&config), Some(HeartbeatEvent::SendPing));
        state.mark_ping_sent();
        assert_eq!(state.evaluate(&config), Some(HeartbeatEvent::Timeout));

        state.record_activity();
        assert!(!state.is_ping_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_reports_timeout_on_silence() {
        let state = Arc::new(HeartbeatState::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(config(100), Arc::clone(&state), tx, cancel);
        let handle = tokio::spawn(manager.run());

        assert_eq!(rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(rx.recv().await, Some(HeartbeatEvent::Timeout));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn manager_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(
            HeartbeatConfig::default(),
            Arc::new(HeartbeatState::new()),
            tx,
            cancel.clone(),
        );
        let handle = tokio::spawn(manager.run());
        cancel.cancel();
        handle.await.unwrap();
    }
}
