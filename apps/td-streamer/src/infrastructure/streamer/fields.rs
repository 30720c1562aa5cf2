//! Positional Field Tables
//!
//! Content entries index their fields by stringified position (`"0"`,
//! `"1"`, ...). The numbering is service specific; these tables name each
//! position once so the segregator never indexes by magic strings.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::domain::service::ChartLayout;
use crate::domain::subscription::Sequence;

/// Entry key (symbol or composite key).
pub const KEY: &str = "key";

/// Entry sequence number.
pub const SEQUENCE: &str = "seq";

/// `ACCT_ACTIVITY` positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityFields {
    /// Account number.
    pub account: &'static str,
    /// Message type.
    pub message_type: &'static str,
    /// XML payload.
    pub message_data: &'static str,
}

/// Account activity layout.
pub const ACCT_ACTIVITY: ActivityFields = ActivityFields {
    account: "1",
    message_type: "2",
    message_data: "3",
};

/// `TIMESALE_*` positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSaleFields {
    /// Trade time (epoch ms).
    pub time: &'static str,
    /// Last price.
    pub price: &'static str,
    /// Last size.
    pub size: &'static str,
    /// Previous print's sequence.
    pub last_sequence: &'static str,
}

/// Time and sales layout, shared by equity, futures and options.
pub const TIMESALE: TimeSaleFields = TimeSaleFields {
    time: "1",
    price: "2",
    size: "3",
    last_sequence: "4",
};

/// `CHART_*` positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartFields {
    /// Candle time (epoch ms).
    pub time: &'static str,
    /// Open.
    pub open: &'static str,
    /// High.
    pub high: &'static str,
    /// Low.
    pub low: &'static str,
    /// Close.
    pub close: &'static str,
    /// Volume.
    pub volume: &'static str,
    /// Candle sequence, equity only.
    pub last_sequence: Option<&'static str>,
    /// Chart day, equity only.
    pub chart_day: Option<&'static str>,
}

/// `CHART_EQUITY` layout.
pub const CHART_EQUITY: ChartFields = ChartFields {
    time: "7",
    open: "1",
    high: "2",
    low: "3",
    close: "4",
    volume: "5",
    last_sequence: Some("6"),
    chart_day: Some("8"),
};

/// `CHART_FUTURES` / `CHART_OPTIONS` layout.
pub const CHART_FUTURES: ChartFields = ChartFields {
    time: "1",
    open: "2",
    high: "3",
    low: "4",
    close: "5",
    volume: "6",
    last_sequence: None,
    chart_day: None,
};

impl ChartFields {
    /// Table for a chart layout.
    #[must_use]
    pub const fn for_layout(layout: ChartLayout) -> &'static Self {
        match layout {
            ChartLayout::Equity => &CHART_EQUITY,
            ChartLayout::Futures => &CHART_FUTURES,
        }
    }
}

/// Book entry positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookFields {
    /// Book time (epoch ms).
    pub time: &'static str,
    /// Bid levels.
    pub bids: &'static str,
    /// Ask levels.
    pub asks: &'static str,
    /// Level price.
    pub level_price: &'static str,
    /// Level aggregate size.
    pub level_size: &'static str,
    /// Orders at the level.
    pub level_count: &'static str,
    /// Per-order array of the level.
    pub level_orders: &'static str,
    /// Order router id.
    pub order_router: &'static str,
    /// Order size.
    pub order_size: &'static str,
    /// Order reference.
    pub order_reference: &'static str,
}

/// Layout shared by `LISTED_BOOK`, `NASDAQ_BOOK` and `OPTIONS_BOOK`.
pub const BOOK: BookFields = BookFields {
    time: "1",
    bids: "2",
    asks: "3",
    level_price: "0",
    level_size: "1",
    level_count: "2",
    level_orders: "3",
    order_router: "0",
    order_size: "1",
    order_reference: "2",
};

// =============================================================================
// Value readers
// =============================================================================

/// Parse a decimal from the JSON number text (or a numeric string).
#[must_use]
pub fn decimal(entry: &Map<String, Value>, position: &str) -> Option<Decimal> {
    match entry.get(position)? {
        Value::Number(number) => parse_decimal(&number.to_string()),
        Value::String(text) => parse_decimal(text.trim()),
        _ => None,
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Read an integer; numeric strings are accepted.
#[must_use]
pub fn integer(entry: &Map<String, Value>, position: &str) -> Option<i64> {
    match entry.get(position)? {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && float.fract().abs() < f64::EPSILON)
                .and_then(|float| format!("{float:.0}").parse().ok())
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Read the entry sequence, if present and non-negative.
#[must_use]
pub fn sequence(entry: &Map<String, Value>) -> Option<Sequence> {
    integer(entry, SEQUENCE).and_then(|value| Sequence::try_from(value).ok())
}

/// Read a value as text; numbers are rendered as sent.
#[must_use]
pub fn text(entry: &Map<String, Value>, position: &str) -> Option<String> {
    match entry.get(position)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

/// Read an array of objects; anything else yields an empty list.
#[must_use]
pub fn objects<'a>(entry: &'a Map<String, Value>, position: &str) -> Vec<&'a Map<String, Value>> {
    entry
        .get(position)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}
