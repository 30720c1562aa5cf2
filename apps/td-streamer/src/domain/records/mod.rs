//! Data Records
//!
//! One normalized record per content entry (or per book order). Records are
//! appended to a per-service buffer by the segregator, drained by the
//! persistence flusher and read by observers.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::service::{ChartLayout, Service, ServiceFamily};
use super::subscription::Sequence;
use super::time::format_record_time;

// =============================================================================
// Records
// =============================================================================

/// Book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Bid side.
    Bid,
    /// Ask side.
    Ask,
}

impl Side {
    /// Label used in records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bid => "Bid",
            Self::Ask => "Ask",
        }
    }
}

/// Parsed account activity payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityPayload {
    /// Root element name, e.g. `OrderFillMessage`.
    pub root: String,
    /// Element tree under the root.
    pub body: Value,
}

/// `ACCT_ACTIVITY` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountActivityRecord {
    /// Frame timestamp (epoch ms).
    pub message_timestamp: i64,
    /// Subscription key.
    pub key: String,
    /// Entry sequence.
    pub sequence: Option<Sequence>,
    /// Message type, e.g. `OrderFill` or `SUBSCRIBED`.
    pub message_type: String,
    /// Account number; absent on status entries.
    pub account: Option<String>,
    /// Decoded payload; absent on status entries or undecodable markup.
    pub payload: Option<ActivityPayload>,
}

impl AccountActivityRecord {
    /// Whether this is a subscription status entry rather than an activity.
    #[must_use]
    pub fn is_status(&self) -> bool {
        is_activity_status(&self.message_type)
    }
}

/// Message types that carry no markup payload.
#[must_use]
pub fn is_activity_status(message_type: &str) -> bool {
    matches!(message_type, "SUBSCRIBED" | "ERROR")
}

/// Time-and-sales print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSaleRecord {
    /// Adjusted trade time.
    pub time: NaiveDateTime,
    /// Symbol.
    pub symbol: String,
    /// Entry sequence.
    pub sequence: Option<Sequence>,
    /// Last price.
    pub price: Decimal,
    /// Last size.
    pub size: Decimal,
    /// Sequence of the previous print.
    pub last_sequence: Option<i64>,
    /// Frame timestamp (epoch ms).
    pub message_timestamp: i64,
}

/// Chart candle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRecord {
    /// Adjusted candle time.
    pub time: NaiveDateTime,
    /// Symbol.
    pub symbol: String,
    /// Entry sequence.
    pub sequence: Option<Sequence>,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
    /// Volume.
    pub volume: Decimal,
    /// Candle sequence (equity layout only).
    pub last_sequence: Option<i64>,
    /// Chart day (equity layout only).
    pub chart_day: Option<i64>,
    /// Frame timestamp (epoch ms).
    pub message_timestamp: i64,
}

/// One order resting at a book price level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookOrder {
    /// Market maker or exchange id.
    pub router: String,
    /// Order size.
    pub size: Decimal,
    /// Order reference as sent.
    pub reference: String,
}

/// One price level of a depth book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookLevelRecord {
    /// Adjusted book time.
    pub time: NaiveDateTime,
    /// Symbol.
    pub symbol: String,
    /// Side of the level.
    pub side: Side,
    /// Level price.
    pub price: Decimal,
    /// Level aggregate size.
    pub size: Decimal,
    /// Orders at the level, as reported.
    pub order_count: i64,
    /// Per-order detail in source order.
    pub orders: Vec<BookOrder>,
    /// Frame timestamp (epoch ms).
    pub message_timestamp: i64,
}

impl BookLevelRecord {
    fn orders_json(&self) -> String {
        Value::Array(
            self.orders
                .iter()
                .map(|order| {
                    json!({
                        "router": order.router,
                        "size": order.size.to_string(),
                        "reference": order.reference,
                    })
                })
                .collect(),
        )
        .to_string()
    }
}

/// Anything without a dedicated layout.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericRecord {
    /// Service name.
    pub service: Service,
    /// Frame timestamp (epoch ms).
    pub message_timestamp: i64,
    /// Key.
    pub key: String,
    /// Entry sequence, when present.
    pub sequence: Option<Sequence>,
    /// Raw content entry.
    pub content: Value,
}

/// A segregated record.
#[derive(Debug, Clone, PartialEq)]
pub enum DataRecord {
    /// Account activity.
    AccountActivity(AccountActivityRecord),
    /// Time and sales.
    TimeSale(TimeSaleRecord),
    /// Chart candle.
    Chart(ChartRecord),
    /// Book price level.
    BookLevel(BookLevelRecord),
    /// Raw content.
    Generic(GenericRecord),
}

const ACTIVITY_HEADERS: &[&str] = &[
    "service",
    "timestamp",
    "key",
    "sequence",
    "message_type",
    "account",
    "payload",
];
const TIMESALE_HEADERS: &[&str] = &[
    "datetime",
    "symbol",
    "sequence",
    "price",
    "size",
    "last_sequence",
    "timestamp",
];
const CHART_HEADERS: &[&str] = &[
    "datetime",
    "symbol",
    "sequence",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "last_sequence",
    "chart_day",
    "timestamp",
];
const BOOK_HEADERS: &[&str] = &[
    "datetime",
    "symbol",
    "side",
    "price",
    "size",
    "num_orders",
    "orders",
    "timestamp",
];
const GENERIC_HEADERS: &[&str] = &["service", "timestamp", "key", "sequence", "content"];

impl DataRecord {
    /// CSV header row for records of `service`.
    #[must_use]
    pub const fn headers_for(family: ServiceFamily) -> &'static [&'static str] {
        match family {
            ServiceFamily::AccountActivity => ACTIVITY_HEADERS,
            ServiceFamily::TimeSale => TIMESALE_HEADERS,
            ServiceFamily::Chart(ChartLayout::Equity | ChartLayout::Futures) => CHART_HEADERS,
            ServiceFamily::Book => BOOK_HEADERS,
            ServiceFamily::Generic => GENERIC_HEADERS,
        }
    }

    /// CSV header row matching this record's layout.
    #[must_use]
    pub const fn headers(&self) -> &'static [&'static str] {
        match self {
            Self::AccountActivity(_) => ACTIVITY_HEADERS,
            Self::TimeSale(_) => TIMESALE_HEADERS,
            Self::Chart(_) => CHART_HEADERS,
            Self::BookLevel(_) => BOOK_HEADERS,
            Self::Generic(_) => GENERIC_HEADERS,
        }
    }

    /// Key or symbol the record belongs to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::AccountActivity(record) => &record.key,
            Self::TimeSale(record) => &record.symbol,
            Self::Chart(record) => &record.symbol,
            Self::BookLevel(record) => &record.symbol,
            Self::Generic(record) => &record.key,
        }
    }

    /// Render the record as a CSV row.
    #[must_use]
    pub fn to_row(&self) -> Vec<String> {
        match self {
            Self::AccountActivity(r) => vec![
                Service::AcctActivity.as_str().to_string(),
                r.message_timestamp.to_string(),
                r.key.clone(),
                optional(r.sequence),
                r.message_type.clone(),
                r.account.clone().unwrap_or_default(),
                r.payload
                    .as_ref()
                    .map(|payload| payload.body.to_string())
                    .unwrap_or_default(),
            ],
            Self::TimeSale(r) => vec![
                format_record_time(&r.time),
                r.symbol.clone(),
                optional(r.sequence),
                r.price.to_string(),
                r.size.to_string(),
                optional(r.last_sequence),
                r.message_timestamp.to_string(),
            ],
            Self::Chart(r) => vec![
                format_record_time(&r.time),
                r.symbol.clone(),
                optional(r.sequence),
                r.open.to_string(),
                r.high.to_string(),
                r.low.to_string(),
                r.close.to_string(),
                r.volume.to_string(),
                optional(r.last_sequence),
                optional(r.chart_day),
                r.message_timestamp.to_string(),
            ],
            Self::BookLevel(r) => vec![
                format_record_time(&r.time),
                r.symbol.clone(),
                r.side.as_str().to_string(),
                r.price.to_string(),
                r.size.to_string(),
                r.order_count.to_string(),
                r.orders_json(),
                r.message_timestamp.to_string(),
            ],
            Self::Generic(r) => vec![
                r.service.as_str().to_string(),
                r.message_timestamp.to_string(),
                r.key.clone(),
                optional(r.sequence),
                r.content.to_string(),
            ],
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// =============================================================================
// Buffer
// =============================================================================

/// Records kept per service before the oldest are evicted.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100_000;

#[derive(Debug, Default)]
struct ServiceBuffer {
    pending: VecDeque<DataRecord>,
    appended_total: u64,
    dropped_total: u64,
}

/// Per-service record buffers, each behind its own lock.
///
/// Each buffer holds at most `capacity` records; appending past that
/// evicts the oldest.
#[derive(Debug)]
pub struct RecordBuffer {
    capacity: usize,
    services: RwLock<IndexMap<Service, Arc<Mutex<ServiceBuffer>>>>,
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl RecordBuffer {
    /// Create an empty buffer set with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer set holding at most `capacity` records per
    /// service.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            services: RwLock::new(IndexMap::new()),
        }
    }

    fn slot(&self, service: &Service) -> Arc<Mutex<ServiceBuffer>> {
        if let Some(slot) = self.services.read().get(service) {
            return Arc::clone(slot);
        }
        Arc::clone(self.services.write().entry(service.clone()).or_default())
    }

    /// Append records to `service`'s buffer, preserving order.
    ///
    /// Returns how many of the oldest records were evicted to stay within
    /// capacity.
    pub fn append<I>(&self, service: &Service, records: I) -> usize
    where
        I: IntoIterator<Item = DataRecord>,
    {
        let slot = self.slot(service);
        let mut buffer = slot.lock();
        let before = buffer.pending.len();
        buffer.pending.extend(records);
        let added = buffer.pending.len() - before;
        buffer.appended_total += added as u64;

        let overflow = buffer.pending.len().saturating_sub(self.capacity);
        if overflow > 0 {
            buffer.pending.drain(..overflow);
            buffer.dropped_total += overflow as u64;
        }
        overflow
    }

    fn existing(&self, service: &Service) -> Option<Arc<Mutex<ServiceBuffer>>> {
        self.services.read().get(service).map(Arc::clone)
    }

    /// Take every record buffered for `service` since the last drain.
    #[must_use]
    pub fn drain(&self, service: &Service) -> Vec<DataRecord> {
        let Some(slot) = self.existing(service) else {
            return Vec::new();
        };
        let mut buffer = slot.lock();
        std::mem::take(&mut buffer.pending).into()
    }

    /// Copy of the records currently buffered for `service`.
    #[must_use]
    pub fn snapshot(&self, service: &Service) -> Vec<DataRecord> {
        let Some(slot) = self.existing(service) else {
            return Vec::new();
        };
        let buffer = slot.lock();
        buffer.pending.iter().cloned().collect()
    }

    /// Records currently buffered for `service`.
    #[must_use]
    pub fn pending(&self, service: &Service) -> usize {
        let Some(slot) = self.existing(service) else {
            return 0;
        };
        let buffer = slot.lock();
        buffer.pending.len()
    }

    /// Records ever appended for `service`.
    #[must_use]
    pub fn appended_total(&self, service: &Service) -> u64 {
        let Some(slot) = self.existing(service) else {
            return 0;
        };
        let buffer = slot.lock();
        buffer.appended_total
    }

    /// Records evicted from `service`'s buffer because it was full.
    #[must_use]
    pub fn dropped_total(&self, service: &Service) -> u64 {
        let Some(slot) = self.existing(service) else {
            return 0;
        };
        let buffer = slot.lock();
        buffer.dropped_total
    }

    /// Services that have ever received records.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.services.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::NaiveDate;

    use super::*;

    fn time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 3, 1)
            .unwrap()
            .and_hms_milli_opt(10, 30, 0, 250)
            .unwrap()
    }

    fn chart(symbol: &str, close: &str) -> DataRecord {
        DataRecord::Chart(ChartRecord {
            time: time(),
            symbol: symbol.to_string(),
            sequence: Some(12),
            open: Decimal::from_str("390.1").unwrap(),
            high: Decimal::from_str("390.5").unwrap(),
            low: Decimal::from_str("389.9").unwrap(),
            close: Decimal::from_str(close).unwrap(),
            volume: Decimal::from(15_300),
            last_sequence: Some(630),
            chart_day: Some(18_687),
            message_timestamp: 1_614_612_600_900,
        })
    }

    #[test]
    fn chart_row_matches_headers() {
        let record = chart("SPY", "390.2");
        let row = record.to_row();
        assert_eq!(row.len(), record.headers().len());
        assert_eq!(
            row,
            vec![
                "2021-03-01 10:30:00.250",
                "SPY",
                "12",
                "390.1",
                "390.5",
                "389.9",
                "390.2",
                "15300",
                "630",
                "18687",
                "1614612600900",
            ]
        );
    }

    #[test]
    fn status_activity_row_leaves_payload_empty() {
        let record = DataRecord::AccountActivity(AccountActivityRecord {
            message_timestamp: 1,
            key: "sub-key".to_string(),
            sequence: Some(0),
            message_type: "SUBSCRIBED".to_string(),
            account: None,
            payload: None,
        });
        let row = record.to_row();
        assert_eq!(row[0], "ACCT_ACTIVITY");
        assert_eq!(row[4], "SUBSCRIBED");
        assert_eq!(row[5], "");
        assert_eq!(row[6], "");
    }

    #[test]
    fn book_level_row_nests_orders() {
        let record = DataRecord::BookLevel(BookLevelRecord {
            time: time(),
            symbol: "AAPL".to_string(),
            side: Side::Ask,
            price: Decimal::from_str("121.5").unwrap(),
            size: Decimal::from(300),
            order_count: 2,
            orders: vec![
                BookOrder {
                    router: "NSDQ".to_string(),
                    size: Decimal::from(200),
                    reference: "1".to_string(),
                },
                BookOrder {
                    router: "ARCX".to_string(),
                    size: Decimal::from(100),
                    reference: "2".to_string(),
                },
            ],
            message_timestamp: 7,
        });
        let row = record.to_row();
        assert_eq!(row.len(), record.headers().len());
        assert_eq!(row[2], "Ask");
        assert_eq!(row[5], "2");
        assert_eq!(
            row[6],
            r#"[{"router":"NSDQ","size":"200","reference":"1"},{"router":"ARCX","size":"100","reference":"2"}]"#
        );
    }

    #[test]
    fn headers_by_family() {
        assert_eq!(
            DataRecord::headers_for(ServiceFamily::Book).len(),
            BOOK_HEADERS.len()
        );
        assert_eq!(
            DataRecord::headers_for(ServiceFamily::Chart(ChartLayout::Futures)),
            CHART_HEADERS
        );
        assert_eq!(DataRecord::headers_for(ServiceFamily::Generic)[4], "content");
    }

    #[test]
    fn buffer_append_and_drain() {
        let buffer = RecordBuffer::new();
        let service = Service::ChartEquity;

        buffer.append(&service, vec![chart("SPY", "1"), chart("AAPL", "2")]);
        assert_eq!(buffer.pending(&service), 2);
        assert_eq!(buffer.snapshot(&service).len(), 2);

        let drained = buffer.drain(&service);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key(), "SPY");
        assert_eq!(drained[1].key(), "AAPL");
        assert_eq!(buffer.pending(&service), 0);

        buffer.append(&service, vec![chart("QQQ", "3")]);
        assert_eq!(buffer.drain(&service).len(), 1);
        assert_eq!(buffer.appended_total(&service), 3);
    }

    #[test]
    fn full_buffer_evicts_oldest() {
        let buffer = RecordBuffer::with_capacity(2);
        let service = Service::ChartEquity;

        assert_eq!(buffer.append(&service, vec![chart("SPY", "1")]), 0);
        assert_eq!(
            buffer.append(&service, vec![chart("AAPL", "2"), chart("QQQ", "3")]),
            1
        );

        let kept: Vec<_> = buffer.snapshot(&service).iter().map(|r| r.key().to_string()).collect();
        assert_eq!(kept, vec!["AAPL", "QQQ"]);
        assert_eq!(buffer.dropped_total(&service), 1);
        assert_eq!(buffer.appended_total(&service), 3);
        assert_eq!(buffer.dropped_total(&Service::Quote), 0);
    }

    #[test]
    fn drain_unknown_service_is_empty() {
        let buffer = RecordBuffer::new();
        assert!(buffer.drain(&Service::Quote).is_empty());
        assert!(buffer.services().is_empty());
    }
}
