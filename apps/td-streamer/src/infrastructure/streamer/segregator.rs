//! Segregator
//!
//! Splits one `data` block into typed records for its service family and
//! collects the `(key, seq)` observations the gap detector must check.
//! Entries that lack a required field are dropped with a warning; the rest
//! of the block is still processed.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::domain::records::{
    AccountActivityRecord, BookLevelRecord, BookOrder, ChartRecord, DataRecord, GenericRecord,
    Side, TimeSaleRecord, is_activity_status,
};
use crate::domain::service::{ChartLayout, Service, ServiceFamily};
use crate::domain::subscription::Sequence;
use crate::domain::time::SessionClock;

use super::activity::{ActivityDecoder, XmlActivityDecoder};
use super::fields::{self, ACCT_ACTIVITY, BOOK, ChartFields, TIMESALE};
use super::messages::DataMessage;

/// Records and sequence observations extracted from one data block.
#[derive(Debug, Clone, PartialEq)]
pub struct SegregatedBlock {
    /// Service of the block.
    pub service: Service,
    /// Records in content order.
    pub records: Vec<DataRecord>,
    /// `(key, seq)` pairs to check, in content order.
    pub observations: Vec<(String, Sequence)>,
    /// Entries dropped as incomplete.
    pub dropped: usize,
}

/// Family-aware record builder.
#[derive(Clone)]
pub struct Segregator {
    clock: SessionClock,
    decoder: Arc<dyn ActivityDecoder>,
    segregate: bool,
}

impl std::fmt::Debug for Segregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segregator")
            .field("clock", &self.clock)
            .field("segregate", &self.segregate)
            .finish_non_exhaustive()
    }
}

impl Segregator {
    /// Segregator using the XML activity decoder.
    #[must_use]
    pub fn new(clock: SessionClock) -> Self {
        Self::with_decoder(clock, Arc::new(XmlActivityDecoder::new()))
    }

    /// Segregator with a custom activity decoder.
    #[must_use]
    pub fn with_decoder(clock: SessionClock, decoder: Arc<dyn ActivityDecoder>) -> Self {
        Self {
            clock,
            decoder,
            segregate: true,
        }
    }

    /// When disabled, every service is kept as generic records.
    #[must_use]
    pub const fn segregating(mut self, enabled: bool) -> Self {
        self.segregate = enabled;
        self
    }

    /// Clock used for time adjustment.
    #[must_use]
    pub const fn clock(&self) -> &SessionClock {
        &self.clock
    }

    /// Segregate one data block.
    #[must_use]
    pub fn segregate(&self, block: &DataMessage) -> SegregatedBlock {
        let service = block.service();
        let family = if self.segregate {
            service.family()
        } else {
            ServiceFamily::Generic
        };

        let mut out = SegregatedBlock {
            service: service.clone(),
            records: Vec::with_capacity(block.content.len()),
            observations: Vec::new(),
            dropped: 0,
        };

        for entry in &block.content {
            let Some(key) = fields::text(entry, fields::KEY) else {
                tracing::warn!(service = %service, "Dropping content entry without key");
                out.dropped += 1;
                continue;
            };
            let sequence = fields::sequence(entry);

            let before = out.records.len();
            match family {
                ServiceFamily::AccountActivity => {
                    out.records
                        .push(self.activity(block.timestamp, &key, sequence, entry));
                }
                ServiceFamily::TimeSale => {
                    out.records
                        .extend(self.time_sale(block.timestamp, &key, sequence, entry));
                }
                ServiceFamily::Chart(layout) => {
                    out.records
                        .extend(self.chart(layout, block.timestamp, &key, sequence, entry));
                }
                ServiceFamily::Book => {
                    out.records
                        .extend(self.book(block.timestamp, &key, entry));
                }
                ServiceFamily::Generic => out.records.push(DataRecord::Generic(GenericRecord {
                    service: service.clone(),
                    message_timestamp: block.timestamp,
                    key: key.clone(),
                    sequence,
                    content: Value::Object(entry.clone()),
                })),
            }

            if family != ServiceFamily::Book && out.records.len() == before {
                tracing::warn!(service = %service, key = %key, "Dropping incomplete content entry");
                out.dropped += 1;
            }

            // Books carry no per-key sequence worth checking.
            if family != ServiceFamily::Book
                && let Some(sequence) = sequence
            {
                out.observations.push((key, sequence));
            }
        }

        out
    }

    fn activity(
        &self,
        message_timestamp: i64,
        key: &str,
        sequence: Option<Sequence>,
        entry: &Map<String, Value>,
    ) -> DataRecord {
        let message_type = fields::text(entry, ACCT_ACTIVITY.message_type).unwrap_or_default();

        let (account, payload) = if is_activity_status(&message_type) {
            (None, None)
        } else {
            let account = fields::text(entry, ACCT_ACTIVITY.account);
            let payload = fields::text(entry, ACCT_ACTIVITY.message_data).and_then(|markup| {
                self.decoder
                    .decode(&message_type, &markup)
                    .inspect_err(|e| {
                        tracing::warn!(
                            key,
                            message_type = %message_type,
                            error = %e,
                            "Keeping activity without payload"
                        );
                    })
                    .ok()
            });
            (account, payload)
        };

        DataRecord::AccountActivity(AccountActivityRecord {
            message_timestamp,
            key: key.to_string(),
            sequence,
            message_type,
            account,
            payload,
        })
    }

    fn time_sale(
        &self,
        message_timestamp: i64,
        key: &str,
        sequence: Option<Sequence>,
        entry: &Map<String, Value>,
    ) -> Option<DataRecord> {
        Some(DataRecord::TimeSale(TimeSaleRecord {
            time: self.clock.adjust(fields::integer(entry, TIMESALE.time)?)?,
            symbol: key.to_string(),
            sequence,
            price: fields::decimal(entry, TIMESALE.price)?,
            size: fields::decimal(entry, TIMESALE.size)?,
            last_sequence: fields::integer(entry, TIMESALE.last_sequence),
            message_timestamp,
        }))
    }

    fn chart(
        &self,
        layout: ChartLayout,
        message_timestamp: i64,
        key: &str,
        sequence: Option<Sequence>,
        entry: &Map<String, Value>,
    ) -> Option<DataRecord> {
        let table = ChartFields::for_layout(layout);
        Some(DataRecord::Chart(ChartRecord {
            time: self.clock.adjust(fields::integer(entry, table.time)?)?,
            symbol: key.to_string(),
            sequence,
            open: fields::decimal(entry, table.open)?,
            high: fields::decimal(entry, table.high)?,
            low: fields::decimal(entry, table.low)?,
            close: fields::decimal(entry, table.close)?,
            volume: fields::decimal(entry, table.volume)?,
            last_sequence: table
                .last_sequence
                .and_then(|position| fields::integer(entry, position)),
            chart_day: table
                .chart_day
                .and_then(|position| fields::integer(entry, position)),
            message_timestamp,
        }))
    }

    /// One record per price level, bids first, each side in array order.
    fn book(&self, message_timestamp: i64, key: &str, entry: &Map<String, Value>) -> Vec<DataRecord> {
        let Some(time) = fields::integer(entry, BOOK.time).and_then(|ms| self.clock.adjust(ms))
        else {
            tracing::warn!(key, "Dropping book entry without time");
            return Vec::new();
        };

        let mut records = Vec::new();
        for (side, position) in [(Side::Bid, BOOK.bids), (Side::Ask, BOOK.asks)] {
            for level in fields::objects(entry, position) {
                let (Some(price), Some(size)) = (
                    fields::decimal(level, BOOK.level_price),
                    fields::decimal(level, BOOK.level_size),
                ) else {
                    tracing::warn!(key, side = side.as_str(), "Dropping book level without price or size");
                    continue;
                };

                let orders = fields::objects(level, BOOK.level_orders)
                    .into_iter()
                    .map(|order| BookOrder {
                        router: fields::text(order, BOOK.order_router).unwrap_or_default(),
                        size: fields::decimal(order, BOOK.order_size).unwrap_or_default(),
                        reference: fields::text(order, BOOK.order_reference).unwrap_or_default(),
                    })
                    .collect::<Vec<_>>();

                records.push(DataRecord::BookLevel(BookLevelRecord {
                    time,
                    symbol: key.to_string(),
                    side,
                    price,
                    size,
                    order_count: fields::integer(level, BOOK.level_count)
                        .unwrap_or_else(|| i64::try_from(orders.len()).unwrap_or(i64::MAX)),
                    orders,
                    message_timestamp,
                }));
            }
        }
        records
    }
}
