//! Outbound Command Frames
//!
//! Every command is sent as
//!
//! ```json
//! {"requests": [{"service": "...", "requestid": "3", "command": "SUBS",
//!                "account": "...", "source": "...", "parameters": {...}}]}
//! ```
//!
//! Field names and the stringly-typed `requestid` are part of the wire
//! contract and must not change.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::domain::service::{Command, QosLevel, Service, request_ids};
use crate::domain::session::StreamingCredentials;
use crate::domain::subscription::AppliedCommand;

use super::codec::CodecError;

/// Protocol version sent with LOGIN.
pub const PROTOCOL_VERSION: &str = "1.0";

/// One request inside a command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Target service.
    pub service: String,
    /// Request id, sent as a string.
    pub requestid: String,
    /// Command verb.
    pub command: String,
    /// Account the session is logged in as.
    pub account: String,
    /// Application id.
    pub source: String,
    /// Command-specific parameters.
    pub parameters: Map<String, Value>,
}

impl Request {
    /// Parsed command verb.
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        Command::from_wire(&self.command)
    }
}

/// Top-level command frame.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Requests carried by the frame.
    pub requests: &'a [Request],
}

/// Serialize requests into one command frame.
///
/// # Errors
///
/// Returns `CodecError::Json` if serialization fails.
pub fn encode(requests: &[Request]) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&RequestEnvelope { requests })?)
}

/// Parameters of a `CHART_HISTORY_FUTURES` GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartHistoryQuery {
    /// Futures symbol, e.g. `/ES`.
    pub symbol: String,
    /// Candle size: `m1`, `m5`, `m10`, `m30`, `h1`, `d1`, `w1` or `n1`.
    pub frequency: String,
    /// Lookback, e.g. `d5`; ignored by the server when both bounds are set.
    pub period: String,
    /// Start bound, epoch milliseconds.
    pub start_ms: Option<i64>,
    /// End bound, epoch milliseconds.
    pub end_ms: Option<i64>,
}

impl Default for ChartHistoryQuery {
    fn default() -> Self {
        Self {
            symbol: "/ES".to_string(),
            frequency: "m5".to_string(),
            period: "d5".to_string(),
            start_ms: None,
            end_ms: None,
        }
    }
}

/// Builds requests stamped with the current session's account and source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuilder {
    account: String,
    source: String,
}

impl CommandBuilder {
    /// Builder for the session described by `credentials`.
    #[must_use]
    pub fn new(credentials: &StreamingCredentials) -> Self {
        Self {
            account: credentials.user_id.clone(),
            source: credentials.app_id.clone(),
        }
    }

    fn request(
        &self,
        service: &Service,
        request_id: u32,
        command: Command,
        parameters: Map<String, Value>,
    ) -> Request {
        Request {
            service: service.as_str().to_string(),
            requestid: request_id.to_string(),
            command: command.as_str().to_string(),
            account: self.account.clone(),
            source: self.source.clone(),
            parameters,
        }
    }

    /// LOGIN request carrying the URL-encoded credential blob.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UrlEncode` if the blob cannot be encoded.
    pub fn login(&self, credentials: &StreamingCredentials) -> Result<Request, CodecError> {
        let blob = credential_blob(credentials)?;
        let mut parameters = Map::new();
        parameters.insert("credential".to_string(), Value::String(blob));
        parameters.insert("token".to_string(), Value::String(credentials.token.clone()));
        parameters.insert(
            "version".to_string(),
            Value::String(PROTOCOL_VERSION.to_string()),
        );
        Ok(self.request(&Service::Admin, request_ids::LOGIN, Command::Login, parameters))
    }

    /// LOGOUT request.
    #[must_use]
    pub fn logout(&self) -> Request {
        self.request(
            &Service::Admin,
            request_ids::LOGOUT,
            Command::Logout,
            Map::new(),
        )
    }

    /// QOS request.
    #[must_use]
    pub fn qos(&self, level: QosLevel) -> Request {
        let mut parameters = Map::new();
        parameters.insert(
            "qoslevel".to_string(),
            Value::String(level.code().to_string()),
        );
        self.request(&Service::Admin, request_ids::QOS, Command::Qos, parameters)
    }

    /// SUBS / ADD / UNSUBS request for an applied registry command.
    #[must_use]
    pub fn subscription(&self, applied: &AppliedCommand) -> Request {
        let mut parameters = Map::new();
        parameters.insert("keys".to_string(), Value::String(applied.keys.join(",")));
        parameters.insert(
            "fields".to_string(),
            Value::String(join_fields(&applied.fields)),
        );
        self.request(
            &applied.service,
            applied.request_id,
            applied.command.command(),
            parameters,
        )
    }

    /// `NEWS_HEADLINELIST` GET for `keys`.
    #[must_use]
    pub fn news_headline_list(&self, keys: &[String]) -> Request {
        let mut parameters = Map::new();
        parameters.insert("keys".to_string(), Value::String(keys.join(",")));
        self.request(
            &Service::NewsHeadlineList,
            request_ids::NEWS_HEADLINE_LIST,
            Command::Get,
            parameters,
        )
    }

    /// `NEWS_STORY` GET for one story id.
    #[must_use]
    pub fn news_story(&self, story_id: &str) -> Request {
        let mut parameters = Map::new();
        parameters.insert("keys".to_string(), Value::String(story_id.to_string()));
        self.request(
            &Service::NewsStory,
            request_ids::NEWS_STORY,
            Command::Get,
            parameters,
        )
    }

    /// `CHART_HISTORY_FUTURES` GET.
    #[must_use]
    pub fn chart_history_futures(&self, query: &ChartHistoryQuery) -> Request {
        let mut parameters = Map::new();
        parameters.insert("symbol".to_string(), json!(query.symbol));
        parameters.insert("frequency".to_string(), json!(query.frequency));
        parameters.insert("period".to_string(), json!(query.period));
        parameters.insert("END_TIME".to_string(), json!(query.end_ms));
        parameters.insert("START_TIME".to_string(), json!(query.start_ms));
        self.request(
            &Service::ChartHistoryFutures,
            request_ids::CHART_HISTORY_FUTURES,
            Command::Get,
            parameters,
        )
    }
}

/// URL-encoded LOGIN credential blob, keys in the order the server expects.
///
/// # Errors
///
/// Returns `CodecError::UrlEncode` if encoding fails.
pub fn credential_blob(credentials: &StreamingCredentials) -> Result<String, CodecError> {
    let timestamp = credentials.token_timestamp_ms.to_string();
    let pairs: [(&str, &str); 11] = [
        ("userid", credentials.user_id.as_str()),
        ("token", credentials.token.as_str()),
        ("company", credentials.company.as_str()),
        ("segment", credentials.segment.as_str()),
        ("cddomain", credentials.cd_domain.as_str()),
        ("usergroup", credentials.user_group.as_str()),
        ("accesslevel", credentials.access_level.as_str()),
        ("authorized", "Y"),
        ("timestamp", timestamp.as_str()),
        ("appid", credentials.app_id.as_str()),
        ("acl", credentials.acl.as_str()),
    ];
    Ok(serde_urlencoded::to_string(&pairs[..])?)
}

fn join_fields(fields: &[u16]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
