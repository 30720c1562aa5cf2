//! Session Clock
//!
//! Streamer timestamps are milliseconds since the epoch. Records are stamped
//! with a naive session-local time: the epoch instant rendered in the
//! process's local zone, minus the whole-hour difference between that zone
//! and a fixed reference zone. Both offsets are sampled once at startup, so
//! a DST change while the process runs is not reflected.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, Utc};

/// Offset of the exchange reference zone used by default (UTC-5).
pub const DEFAULT_REFERENCE_OFFSET_HOURS: i32 = -5;

const SECS_PER_HOUR: i32 = 3600;

/// Fixed, DST-naive time adjustment measured once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClock {
    local_offset_secs: i32,
    offset_hours: i32,
}

impl SessionClock {
    /// Measure the local zone now and compare it to `reference_offset_hours`.
    #[must_use]
    pub fn measure(reference_offset_hours: i32) -> Self {
        let local_offset_secs = Local::now().offset().local_minus_utc();
        Self::from_offsets(local_offset_secs, reference_offset_hours)
    }

    /// Build a clock from an explicit local offset.
    #[must_use]
    pub const fn from_offsets(local_offset_secs: i32, reference_offset_hours: i32) -> Self {
        let reference_secs = reference_offset_hours * SECS_PER_HOUR;
        let diff = local_offset_secs - reference_secs;
        // Whole hours, rounded toward the nearest hour for half-hour zones.
        let offset_hours = (diff + diff.signum() * SECS_PER_HOUR / 2) / SECS_PER_HOUR;
        Self {
            local_offset_secs,
            offset_hours,
        }
    }

    /// Hours subtracted from local time to reach session time.
    #[must_use]
    pub const fn offset_hours(&self) -> i32 {
        self.offset_hours
    }

    /// Convert an epoch-millisecond timestamp to naive session time.
    #[must_use]
    pub fn adjust(&self, epoch_ms: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::<Utc>::from_timestamp_millis(epoch_ms)?;
        self.adjust_utc(utc)
    }

    /// Convert a UTC instant to naive session time.
    #[must_use]
    pub fn adjust_utc(&self, instant: DateTime<Utc>) -> Option<NaiveDateTime> {
        let local = instant
            .naive_utc()
            .checked_add_signed(TimeDelta::seconds(i64::from(self.local_offset_secs)))?;
        local.checked_sub_signed(TimeDelta::hours(i64::from(self.offset_hours)))
    }

    /// Session calendar day for `now`, used to key daily output files.
    #[must_use]
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.adjust_utc(now)
            .map_or_else(|| now.date_naive(), |adjusted| adjusted.date())
    }

    /// Session calendar day for the current instant.
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.session_date(Utc::now())
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::measure(DEFAULT_REFERENCE_OFFSET_HOURS)
    }
}

/// Record timestamp format: milliseconds, no zone.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Render a session time the way records are persisted.
#[must_use]
pub fn format_record_time(time: &NaiveDateTime) -> String {
    time.format(RECORD_TIME_FORMAT).to_string()
}
