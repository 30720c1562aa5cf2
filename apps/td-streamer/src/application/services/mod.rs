//! Observer Callbacks
//!
//! Callers register callbacks that run after each data frame has been
//! segregated, and when an account activity sequence gap is detected.
//! Callbacks never run on the receive task: each invocation is handed to
//! the blocking pool, so a slow callback cannot stall the socket. No
//! ordering is guaranteed between invocations.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;

/// Sentinel passed to legacy string observers on a severe gap.
pub const MISS_SEQUENCE: &str = "MISS SEQUENCE";

/// Event delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamNotification {
    /// A data frame was segregated; buffers hold its records.
    Frame,
    /// Account activity skipped a sequence; account state must be rebuilt.
    MissSequence,
}

impl StreamNotification {
    /// String form of the notification, if it carries one.
    #[must_use]
    pub const fn as_sentinel(&self) -> Option<&'static str> {
        match self {
            Self::Frame => None,
            Self::MissSequence => Some(MISS_SEQUENCE),
        }
    }
}

/// Observer callback.
pub type StreamObserver = Arc<dyn Fn(StreamNotification) + Send + Sync>;

/// Registered observers.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<StreamObserver>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl ObserverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn register<F>(&self, observer: F)
    where
        F: Fn(StreamNotification) + Send + Sync + 'static,
    {
        self.observers.write().push(Arc::new(observer));
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no callback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Invoke every observer with `notification`.
    ///
    /// Inside a Tokio runtime each invocation is spawned on the blocking
    /// pool; outside one, observers run inline.
    pub fn notify(&self, notification: &StreamNotification) {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                for observer in observers {
                    let notification = notification.clone();
                    handle.spawn_blocking(move || observer(notification));
                }
            }
            Err(_) => {
                for observer in observers {
                    observer(notification.clone());
                }
            }
        }
    }
}
