//! Gap Detection
//!
//! Sequence continuity is judged per `(service, key)`. The first frame after
//! a SUBS is always accepted. After that, anything other than `cursor + 1`
//! is a gap. Gaps on account activity are severe because a lost fill
//! desynchronizes position bookkeeping; gaps elsewhere are soft.
//!
//! In every case the cursor moves to the observed value so checking resumes
//! from the new baseline.

use std::sync::Arc;

use super::service::Service;
use super::subscription::{CursorUpdate, Sequence, SubscriptionRegistry};

/// How a gap must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapSeverity {
    /// Account state must be rebuilt from authoritative data.
    Severe,
    /// Logged and tolerated after a transport probe.
    Soft,
}

impl GapSeverity {
    /// Severity for a gap on `service`.
    #[must_use]
    pub const fn for_service(service: &Service) -> Self {
        match service {
            Service::AcctActivity => Self::Severe,
            _ => Self::Soft,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Severe => "severe",
            Self::Soft => "soft",
        }
    }
}

/// A detected discontinuity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    /// Service the key belongs to.
    pub service: Service,
    /// Key whose sequence jumped.
    pub key: String,
    /// Cursor before the observation.
    pub previous: Sequence,
    /// Observed sequence, now the cursor.
    pub observed: Sequence,
    /// Handling policy.
    pub severity: GapSeverity,
}

/// Result of one sequence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First frame since SUBS; accepted unconditionally.
    FirstObservation,
    /// `previous + 1`.
    InOrder,
    /// Gap or regression.
    Gap(SequenceGap),
    /// Key is not subscribed; nothing was checked or stored.
    Untracked,
}

impl SequenceCheck {
    /// Whether this check produced an anomaly.
    #[must_use]
    pub const fn is_gap(&self) -> bool {
        matches!(self, Self::Gap(_))
    }
}

/// Classify an observation against the previous cursor value.
#[must_use]
pub fn classify(
    service: &Service,
    key: &str,
    previous: Option<Sequence>,
    observed: Sequence,
) -> SequenceCheck {
    match previous {
        None => SequenceCheck::FirstObservation,
        Some(previous) if previous.checked_add(1) == Some(observed) => SequenceCheck::InOrder,
        Some(previous) => SequenceCheck::Gap(SequenceGap {
            service: service.clone(),
            key: key.to_string(),
            previous,
            observed,
            severity: GapSeverity::for_service(service),
        }),
    }
}

/// Checks observations against the registry's cursors.
#[derive(Debug, Clone)]
pub struct GapDetector {
    registry: Arc<SubscriptionRegistry>,
}

impl GapDetector {
    /// Create a detector backed by `registry`.
    #[must_use]
    pub const fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Check `sequence` for `(service, key)` and advance the cursor.
    pub fn check(&self, service: &Service, key: &str, sequence: Sequence) -> SequenceCheck {
        match self.registry.swap_cursor(service, key, sequence) {
            CursorUpdate::Untracked => SequenceCheck::Untracked,
            CursorUpdate::Replaced(previous) => classify(service, key, previous, sequence),
        }
    }
}
