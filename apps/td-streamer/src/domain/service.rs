//! Service Catalogue
//!
//! The streamer multiplexes many feed families over one connection. Each
//! family is addressed by a service name on the wire and decoded with a
//! family-specific record layout.

use std::fmt;
use std::time::Duration;

// =============================================================================
// Service
// =============================================================================

/// A named feed on the streamer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    /// Administrative commands (LOGIN, LOGOUT, QOS).
    Admin,
    /// Order and fill activity for the logged-in accounts.
    AcctActivity,
    /// Most active NASDAQ symbols.
    ActivesNasdaq,
    /// Most active NYSE symbols.
    ActivesNyse,
    /// Most active OTCBB symbols.
    ActivesOtcbb,
    /// Most active option contracts.
    ActivesOptions,
    /// One-minute equity candles.
    ChartEquity,
    /// One-minute futures candles.
    ChartFutures,
    /// One-minute option candles.
    ChartOptions,
    /// Level one equity quotes.
    Quote,
    /// Level one option quotes.
    OptionQuote,
    /// Level two book for listed equities.
    ListedBook,
    /// Level two NASDAQ book.
    NasdaqBook,
    /// Level two option book.
    OptionsBook,
    /// Level one futures quotes.
    LeveloneFutures,
    /// Level one forex quotes.
    LeveloneForex,
    /// Equity time and sales.
    TimesaleEquity,
    /// Futures time and sales.
    TimesaleFutures,
    /// Option time and sales.
    TimesaleOptions,
    /// Streaming news headlines.
    NewsHeadline,
    /// One-shot list of recent headlines.
    NewsHeadlineList,
    /// One-shot news story body.
    NewsStory,
    /// One-shot futures chart history.
    ChartHistoryFutures,
    /// Any service name this crate does not know about.
    Other(String),
}

impl Service {
    /// Every service that can be subscribed with SUBS/ADD/UNSUBS.
    pub const STREAMABLE: [Self; 19] = [
        Self::AcctActivity,
        Self::ActivesNasdaq,
        Self::ActivesNyse,
        Self::ActivesOtcbb,
        Self::ActivesOptions,
        Self::ChartEquity,
        Self::ChartFutures,
        Self::ChartOptions,
        Self::Quote,
        Self::OptionQuote,
        Self::ListedBook,
        Self::NasdaqBook,
        Self::OptionsBook,
        Self::LeveloneFutures,
        Self::LeveloneForex,
        Self::TimesaleEquity,
        Self::TimesaleFutures,
        Self::TimesaleOptions,
        Self::NewsHeadline,
    ];

    /// Wire name of the service.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Admin => "ADMIN",
            Self::AcctActivity => "ACCT_ACTIVITY",
            Self::ActivesNasdaq => "ACTIVES_NASDAQ",
            Self::ActivesNyse => "ACTIVES_NYSE",
            Self::ActivesOtcbb => "ACTIVES_OTCBB",
            Self::ActivesOptions => "ACTIVES_OPTIONS",
            Self::ChartEquity => "CHART_EQUITY",
            Self::ChartFutures => "CHART_FUTURES",
            Self::ChartOptions => "CHART_OPTIONS",
            Self::Quote => "QUOTE",
            Self::OptionQuote => "OPTION",
            Self::ListedBook => "LISTED_BOOK",
            Self::NasdaqBook => "NASDAQ_BOOK",
            Self::OptionsBook => "OPTIONS_BOOK",
            Self::LeveloneFutures => "LEVELONE_FUTURES",
            Self::LeveloneForex => "LEVELONE_FOREX",
            Self::TimesaleEquity => "TIMESALE_EQUITY",
            Self::TimesaleFutures => "TIMESALE_FUTURES",
            Self::TimesaleOptions => "TIMESALE_OPTIONS",
            Self::NewsHeadline => "NEWS_HEADLINE",
            Self::NewsHeadlineList => "NEWS_HEADLINELIST",
            Self::NewsStory => "NEWS_STORY",
            Self::ChartHistoryFutures => "CHART_HISTORY_FUTURES",
            Self::Other(name) => name,
        }
    }

    /// Resolve a wire name. Unknown names are kept verbatim.
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        match name {
            "ADMIN" => Self::Admin,
            "ACCT_ACTIVITY" => Self::AcctActivity,
            "ACTIVES_NASDAQ" => Self::ActivesNasdaq,
            "ACTIVES_NYSE" => Self::ActivesNyse,
            "ACTIVES_OTCBB" => Self::ActivesOtcbb,
            "ACTIVES_OPTIONS" => Self::ActivesOptions,
            "CHART_EQUITY" => Self::ChartEquity,
            "CHART_FUTURES" => Self::ChartFutures,
            "CHART_OPTIONS" => Self::ChartOptions,
            "QUOTE" => Self::Quote,
            "OPTION" => Self::OptionQuote,
            "LISTED_BOOK" => Self::ListedBook,
            "NASDAQ_BOOK" => Self::NasdaqBook,
            "OPTIONS_BOOK" => Self::OptionsBook,
            "LEVELONE_FUTURES" => Self::LeveloneFutures,
            "LEVELONE_FOREX" => Self::LeveloneForex,
            "TIMESALE_EQUITY" => Self::TimesaleEquity,
            "TIMESALE_FUTURES" => Self::TimesaleFutures,
            "TIMESALE_OPTIONS" => Self::TimesaleOptions,
            "NEWS_HEADLINE" => Self::NewsHeadline,
            "NEWS_HEADLINELIST" => Self::NewsHeadlineList,
            "NEWS_STORY" => Self::NewsStory,
            "CHART_HISTORY_FUTURES" => Self::ChartHistoryFutures,
            other => Self::Other(other.to_string()),
        }
    }

    /// Record layout used when segregating this service's data.
    #[must_use]
    pub const fn family(&self) -> ServiceFamily {
        match self {
            Self::AcctActivity => ServiceFamily::AccountActivity,
            Self::TimesaleEquity | Self::TimesaleFutures | Self::TimesaleOptions => {
                ServiceFamily::TimeSale
            }
            Self::ChartEquity => ServiceFamily::Chart(ChartLayout::Equity),
            Self::ChartFutures | Self::ChartOptions => ServiceFamily::Chart(ChartLayout::Futures),
            Self::ListedBook | Self::NasdaqBook | Self::OptionsBook => ServiceFamily::Book,
            _ => ServiceFamily::Generic,
        }
    }

    /// Field indices requested when the caller does not name any.
    #[must_use]
    pub fn default_fields(&self) -> Vec<u16> {
        match self {
            Self::AcctActivity => (0..=3).collect(),
            Self::ActivesNasdaq | Self::ActivesNyse | Self::ActivesOtcbb | Self::ActivesOptions => {
                vec![0, 1]
            }
            Self::ChartEquity => (0..=8).collect(),
            Self::ChartFutures | Self::ChartOptions => (0..=6).collect(),
            Self::Quote => QUOTE_FIELDS.to_vec(),
            Self::OptionQuote => (0..=41).collect(),
            Self::ListedBook | Self::NasdaqBook | Self::OptionsBook => (0..=3).collect(),
            Self::LeveloneFutures => (0..=35).collect(),
            Self::LeveloneForex => (0..=28).collect(),
            Self::TimesaleEquity | Self::TimesaleFutures | Self::TimesaleOptions => {
                (0..=4).collect()
            }
            Self::NewsHeadline => (0..=10).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the service accepts SUBS/ADD/UNSUBS.
    #[must_use]
    pub fn is_streamable(&self) -> bool {
        Self::STREAMABLE.contains(self)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level one quote fields 19-21 and 35-36 are not published on the websocket.
const QUOTE_FIELDS: [u16; 48] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 22, 23, 24, 25, 26, 27, 28,
    29, 30, 31, 32, 33, 34, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 50, 51, 52,
];

// =============================================================================
// Families
// =============================================================================

/// Segregation layout for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFamily {
    /// XML payloads keyed by message type.
    AccountActivity,
    /// Prints with price, size and previous sequence.
    TimeSale,
    /// OHLCV candles.
    Chart(ChartLayout),
    /// Nested bid/ask levels with per-order detail.
    Book,
    /// Raw content kept as-is.
    Generic,
}

/// Field numbering differs between equity and futures/option charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartLayout {
    /// `CHART_EQUITY`: OHLCV in 1-5, sequence in 6, time in 7, chart day in 8.
    Equity,
    /// `CHART_FUTURES` / `CHART_OPTIONS`: time in 1, OHLCV in 2-6.
    Futures,
}

// =============================================================================
// Commands
// =============================================================================

/// Command verb carried by an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open the session.
    Login,
    /// Close the session and drop all server-side subscriptions.
    Logout,
    /// Change the update rate.
    Qos,
    /// Replace the subscribed key set.
    Subs,
    /// Add keys to the subscribed set.
    Add,
    /// Remove keys from the subscribed set.
    Unsubs,
    /// One-shot snapshot query.
    Get,
}

impl Command {
    /// Wire name of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Qos => "QOS",
            Self::Subs => "SUBS",
            Self::Add => "ADD",
            Self::Unsubs => "UNSUBS",
            Self::Get => "GET",
        }
    }

    /// Resolve a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "LOGIN" => Some(Self::Login),
            "LOGOUT" => Some(Self::Logout),
            "QOS" => Some(Self::Qos),
            "SUBS" => Some(Self::Subs),
            "ADD" => Some(Self::Add),
            "UNSUBS" => Some(Self::Unsubs),
            "GET" => Some(Self::Get),
            _ => None,
        }
    }
}

/// Fixed request ids for administrative and snapshot requests.
pub mod request_ids {
    /// LOGIN.
    pub const LOGIN: u32 = 0;
    /// LOGOUT.
    pub const LOGOUT: u32 = 1;
    /// QOS.
    pub const QOS: u32 = 2;
    /// First id handed out to subscription services.
    pub const FIRST_SUBSCRIPTION: u32 = 3;
    /// `NEWS_HEADLINELIST` GET.
    pub const NEWS_HEADLINE_LIST: u32 = 22;
    /// `NEWS_STORY` GET.
    pub const NEWS_STORY: u32 = 23;
    /// `CHART_HISTORY_FUTURES` GET.
    pub const CHART_HISTORY_FUTURES: u32 = 24;
}

// =============================================================================
// Quality of Service
// =============================================================================

/// Server-side update rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    /// 500 ms.
    Express,
    /// 750 ms.
    RealTime,
    /// 1000 ms, the websocket default.
    #[default]
    Fast,
    /// 1500 ms.
    Moderate,
    /// 3000 ms.
    Slow,
    /// 5000 ms.
    Delayed,
}

impl QosLevel {
    /// Level from its numeric code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Express),
            1 => Some(Self::RealTime),
            2 => Some(Self::Fast),
            3 => Some(Self::Moderate),
            4 => Some(Self::Slow),
            5 => Some(Self::Delayed),
            _ => None,
        }
    }

    /// Numeric code sent as the `qoslevel` parameter.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Express => 0,
            Self::RealTime => 1,
            Self::Fast => 2,
            Self::Moderate => 3,
            Self::Slow => 4,
            Self::Delayed => 5,
        }
    }

    /// Update interval promised by the server at this level.
    #[must_use]
    pub const fn interval(self) -> Duration {
        Duration::from_millis(match self {
            Self::Express => 500,
            Self::RealTime => 750,
            Self::Fast => 1000,
            Self::Moderate => 1500,
            Self::Slow => 3000,
            Self::Delayed => 5000,
        })
    }
}
