//! Subscription Registry
//!
//! Tracks, per service, the requested field set, the subscribed keys and
//! the last accepted sequence number of each key. The registry is the only
//! place subscription state lives; it outlives individual connections and
//! is replayed after a reconnect.
//!
//! # Invariants
//!
//! - A key has a cursor entry if and only if it is currently subscribed.
//! - A service with no keys is inactive.
//! - Request ids are allocated once per service, monotonically from
//!   [`request_ids::FIRST_SUBSCRIPTION`], and never reused.

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::service::{Command, Service, request_ids};

// =============================================================================
// Types
// =============================================================================

/// Subscription identifier within a service (symbol or composite key).
pub type Key = String;

/// Per-key sequence number assigned by the server.
pub type Sequence = u64;

/// Commands that mutate the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCommand {
    /// Replace the key set.
    Subs,
    /// Union keys into the key set.
    Add,
    /// Remove keys from the key set.
    Unsubs,
}

impl SubscriptionCommand {
    /// Matching wire command.
    #[must_use]
    pub const fn command(self) -> Command {
        match self {
            Self::Subs => Command::Subs,
            Self::Add => Command::Add,
            Self::Unsubs => Command::Unsubs,
        }
    }
}

/// Subscription state of a single service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    request_id: u32,
    fields: Vec<u16>,
    cursors: IndexMap<Key, Option<Sequence>>,
    active: bool,
}

impl Subscription {
    /// Request id used for this service's commands.
    #[must_use]
    pub const fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Requested field indices.
    #[must_use]
    pub fn fields(&self) -> &[u16] {
        &self.fields
    }

    /// Subscribed keys in subscription order.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.cursors.keys().cloned().collect()
    }

    /// Whether `key` is subscribed.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.cursors.contains_key(key)
    }

    /// Last accepted sequence for `key`; `Some(None)` means subscribed but unset.
    #[must_use]
    pub fn cursor(&self, key: &str) -> Option<Option<Sequence>> {
        self.cursors.get(key).copied()
    }

    /// Whether the service is actively subscribed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }
}

/// Registry mutation result, ready to be serialized as a command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCommand {
    /// Target service.
    pub service: Service,
    /// Request id allocated to the service.
    pub request_id: u32,
    /// Applied command.
    pub command: SubscriptionCommand,
    /// Keys as given by the caller.
    pub keys: Vec<Key>,
    /// Fields as given by the caller.
    pub fields: Vec<u16>,
}

/// Outcome of swapping in a newly observed sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorUpdate {
    /// The key is not subscribed; nothing was stored.
    Untracked,
    /// The cursor was updated; carries the previous value.
    Replaced(Option<Sequence>),
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Services with the active flag set.
    pub active_services: usize,
    /// Keys across all active services.
    pub total_keys: usize,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct RegistryState {
    services: IndexMap<Service, Subscription>,
    next_request_id: u32,
}

impl RegistryState {
    fn entry(&mut self, service: &Service) -> &mut Subscription {
        let next_request_id = &mut self.next_request_id;
        self.services.entry(service.clone()).or_insert_with(|| {
            let request_id = *next_request_id;
            *next_request_id += 1;
            Subscription {
                request_id,
                ..Subscription::default()
            }
        })
    }
}

/// Lock-guarded map of service to subscription state.
///
/// A single registry-wide lock keeps multi-key commands atomic with
/// respect to the receive path advancing cursors.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                services: IndexMap::new(),
                next_request_id: request_ids::FIRST_SUBSCRIPTION,
            }),
        }
    }

    /// Apply a subscription command and return what must be sent.
    ///
    /// - `Subs` replaces the key set and resets every cursor to unset.
    /// - `Add` unions keys in; only new keys get a fresh cursor.
    /// - `Unsubs` removes keys and their cursors; unknown keys are ignored.
    ///
    /// `Subs` and `Add` replace the stored field set when `fields` is not
    /// empty. The service is active exactly when its key set is non-empty.
    pub fn apply(
        &self,
        service: &Service,
        command: SubscriptionCommand,
        keys: &[Key],
        fields: &[u16],
    ) -> AppliedCommand {
        let mut state = self.state.write();
        let subscription = state.entry(service);

        match command {
            SubscriptionCommand::Subs => {
                subscription.cursors = keys.iter().map(|key| (key.clone(), None)).collect();
                if !fields.is_empty() {
                    subscription.fields = fields.to_vec();
                }
            }
            SubscriptionCommand::Add => {
                for key in keys {
                    subscription.cursors.entry(key.clone()).or_insert(None);
                }
                if !fields.is_empty() {
                    subscription.fields = fields.to_vec();
                }
            }
            SubscriptionCommand::Unsubs => {
                for key in keys {
                    subscription.cursors.shift_remove(key);
                }
            }
        }
        subscription.active = !subscription.cursors.is_empty();

        AppliedCommand {
            service: service.clone(),
            request_id: subscription.request_id,
            command,
            keys: keys.to_vec(),
            fields: fields.to_vec(),
        }
    }

    /// Request id for `service`, allocating one on first use.
    pub fn request_id(&self, service: &Service) -> u32 {
        self.state.write().entry(service).request_id
    }

    /// Store `sequence` as the cursor of `(service, key)` and return the previous value.
    ///
    /// Keys that are not subscribed are left untouched.
    pub fn swap_cursor(&self, service: &Service, key: &str, sequence: Sequence) -> CursorUpdate {
        let mut state = self.state.write();
        let Some(cursor) = state
            .services
            .get_mut(service)
            .and_then(|subscription| subscription.cursors.get_mut(key))
        else {
            return CursorUpdate::Untracked;
        };
        let previous = cursor.replace(sequence);
        CursorUpdate::Replaced(previous)
    }

    /// Snapshot of a single service's state.
    #[must_use]
    pub fn get(&self, service: &Service) -> Option<Subscription> {
        self.state.read().services.get(service).cloned()
    }

    /// Whether `service` currently has subscribed keys.
    #[must_use]
    pub fn is_active(&self, service: &Service) -> bool {
        self.state
            .read()
            .services
            .get(service)
            .is_some_and(Subscription::is_active)
    }

    /// Subscribed keys of `service`, in subscription order.
    #[must_use]
    pub fn active_keys(&self, service: &Service) -> Vec<Key> {
        self.state
            .read()
            .services
            .get(service)
            .map(Subscription::keys)
            .unwrap_or_default()
    }

    /// Every active service with its state, in first-subscribed order.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<(Service, Subscription)> {
        self.state
            .read()
            .services
            .iter()
            .filter(|(_, subscription)| subscription.active)
            .map(|(service, subscription)| (service.clone(), subscription.clone()))
            .collect()
    }

    /// Services with the active flag set.
    #[must_use]
    pub fn active_services(&self) -> Vec<Service> {
        self.state
            .read()
            .services
            .iter()
            .filter(|(_, subscription)| subscription.active)
            .map(|(service, _)| service.clone())
            .collect()
    }

    /// Drop every key and mark every service inactive.
    ///
    /// Request ids survive so they stay stable for the process lifetime.
    pub fn clear(&self) {
        let mut state = self.state.write();
        for subscription in state.services.values_mut() {
            subscription.cursors.clear();
            subscription.active = false;
        }
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        state
            .services
            .values()
            .filter(|subscription| subscription.active)
            .fold(RegistryStats::default(), |mut stats, subscription| {
                stats.active_services += 1;
                stats.total_keys += subscription.cursors.len();
                stats
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
