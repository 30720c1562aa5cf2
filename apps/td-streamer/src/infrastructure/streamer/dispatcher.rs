//! Frame Dispatcher
//!
//! Routes every decoded message of an inbound frame to its handler and
//! returns the side effects the session must carry out. The dispatcher
//! itself never touches the socket, so it can be driven directly in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::application::services::StreamNotification;
use crate::domain::records::RecordBuffer;
use crate::domain::sequence::{GapDetector, GapSeverity, SequenceCheck};
use crate::infrastructure::metrics;

use super::codec::FrameCodec;
use super::messages::{DataMessage, InboundMessage, ResponseMessage, heartbeat_ms};
use super::segregator::Segregator;

/// Side effect requested by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// LOGIN succeeded.
    LoginAccepted,
    /// LOGIN was refused.
    LoginRejected {
        /// Server code.
        code: i64,
        /// Server message.
        message: String,
    },
    /// Server acknowledged LOGOUT.
    LogoutAcknowledged,
    /// Observers must be notified.
    Notify(StreamNotification),
    /// Check the transport with an express QOS request.
    SendQosPing,
    /// Re-issue the account activity subscription.
    ResubscribeAccountActivity,
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Default number of responses, notices and snapshots retained.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct DiagnosticsState {
    responses: VecDeque<ResponseMessage>,
    notifications: VecDeque<Value>,
    snapshots: VecDeque<Value>,
    last_heartbeat: Option<i64>,
    qos_sent_at: Option<Instant>,
    last_ping_rtt: Option<Duration>,
    untracked_sequences: u64,
}

/// Recent non-data traffic, kept for inspection.
#[derive(Debug)]
pub struct SessionDiagnostics {
    capacity: usize,
    state: Mutex<DiagnosticsState>,
}

impl Default for SessionDiagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

impl SessionDiagnostics {
    /// Keep at most `capacity` entries of each kind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(DiagnosticsState::default()),
        }
    }

    fn record_response(&self, response: ResponseMessage) {
        let mut state = self.state.lock();
        push_bounded(&mut state.responses, response, self.capacity);
    }

    fn record_notification(&self, notification: Value) {
        let mut state = self.state.lock();
        if let Some(heartbeat) = heartbeat_ms(&notification) {
            state.last_heartbeat = Some(heartbeat);
            return;
        }
        push_bounded(&mut state.notifications, notification, self.capacity);
    }

    fn record_snapshot(&self, snapshot: Value) {
        let mut state = self.state.lock();
        push_bounded(&mut state.snapshots, snapshot, self.capacity);
    }

    fn record_untracked(&self) {
        self.state.lock().untracked_sequences += 1;
    }

    /// Note that a QOS request just went out.
    pub fn mark_qos_sent(&self) {
        self.state.lock().qos_sent_at = Some(Instant::now());
    }

    fn complete_qos(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        let rtt = state.qos_sent_at.take()?.elapsed();
        state.last_ping_rtt = Some(rtt);
        Some(rtt)
    }

    /// Responses received, oldest first.
    #[must_use]
    pub fn responses(&self) -> Vec<ResponseMessage> {
        self.state.lock().responses.iter().cloned().collect()
    }

    /// Non-heartbeat notices received, oldest first.
    #[must_use]
    pub fn notifications(&self) -> Vec<Value> {
        self.state.lock().notifications.iter().cloned().collect()
    }

    /// Snapshots received, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Value> {
        self.state.lock().snapshots.iter().cloned().collect()
    }

    /// Server time of the last heartbeat.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<i64> {
        self.state.lock().last_heartbeat
    }

    /// Round trip of the last answered QOS request.
    #[must_use]
    pub fn last_ping_rtt(&self) -> Option<Duration> {
        self.state.lock().last_ping_rtt
    }

    /// Sequenced entries seen for keys that are not subscribed.
    #[must_use]
    pub fn untracked_sequences(&self) -> u64 {
        self.state.lock().untracked_sequences
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Decodes frames and routes their messages.
#[derive(Debug)]
pub struct Dispatcher {
    codec: FrameCodec,
    segregator: Segregator,
    gap_detector: GapDetector,
    buffer: Arc<RecordBuffer>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Dispatcher {
    /// Create a dispatcher writing into `buffer` and `diagnostics`.
    #[must_use]
    pub const fn new(
        segregator: Segregator,
        gap_detector: GapDetector,
        buffer: Arc<RecordBuffer>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            codec: FrameCodec::new(),
            segregator,
            gap_detector,
            buffer,
            diagnostics,
        }
    }

    /// Handle one text frame.
    ///
    /// Gap actions are emitted once per frame; a severe gap produces one
    /// `MissSequence` notification per affected key. A frame that carried
    /// data ends with a single `Frame` notification.
    pub fn on_message(&self, text: &str) -> Vec<DispatchAction> {
        let started = Instant::now();

        let messages = match self.codec.decode(text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
                metrics::record_frame_dropped();
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        let mut had_data = false;
        let mut soft_gap = false;

        for message in messages {
            metrics::record_frame_received(message.kind().as_str());
            match message {
                InboundMessage::Notify(notification) => {
                    self.diagnostics.record_notification(notification);
                }
                InboundMessage::Snapshot(snapshot) => self.diagnostics.record_snapshot(snapshot),
                InboundMessage::Response(response) => {
                    actions.extend(self.on_response(&response));
                    self.diagnostics.record_response(response);
                }
                InboundMessage::Data(block) => {
                    had_data = true;
                    soft_gap |= self.on_data(&block, &mut actions);
                }
            }
        }

        if soft_gap {
            actions.push(DispatchAction::SendQosPing);
            actions.push(DispatchAction::ResubscribeAccountActivity);
        }
        if had_data {
            actions.push(DispatchAction::Notify(StreamNotification::Frame));
        }

        metrics::record_processing_duration(started.elapsed());
        actions
    }

    fn on_response(&self, response: &ResponseMessage) -> Option<DispatchAction> {
        if response.is_login() {
            if response.is_success() {
                tracing::info!(msg = %response.content.msg, "Login accepted");
                return Some(DispatchAction::LoginAccepted);
            }
            tracing::error!(
                code = response.content.code,
                msg = %response.content.msg,
                "Login rejected"
            );
            return Some(DispatchAction::LoginRejected {
                code: response.content.code,
                message: response.content.msg.clone(),
            });
        }

        if response.is_logout() {
            tracing::info!("Logout acknowledged");
            return Some(DispatchAction::LogoutAcknowledged);
        }

        if response.is_qos()
            && let Some(rtt) = self.diagnostics.complete_qos()
        {
            tracing::debug!(rtt_ms = rtt.as_millis(), "QOS answered");
            metrics::record_ping_rtt(rtt);
        }

        if !response.is_success() {
            tracing::warn!(
                service = %response.service,
                command = %response.command,
                requestid = %response.requestid,
                code = response.content.code,
                msg = %response.content.msg,
                "Command failed"
            );
        }
        None
    }

    /// Returns whether a soft gap was seen.
    fn on_data(&self, block: &DataMessage, actions: &mut Vec<DispatchAction>) -> bool {
        let segregated = self.segregator.segregate(block);
        let mut soft_gap = false;

        for (key, sequence) in &segregated.observations {
            let gap = match self.gap_detector.check(&segregated.service, key, *sequence) {
                SequenceCheck::Gap(gap) => gap,
                SequenceCheck::Untracked => {
                    tracing::debug!(
                        service = %segregated.service,
                        key = %key,
                        sequence = *sequence,
                        "Sequence for untracked key"
                    );
                    self.diagnostics.record_untracked();
                    continue;
                }
                SequenceCheck::FirstObservation | SequenceCheck::InOrder => continue,
            };
            metrics::record_sequence_gap(&gap.service, gap.severity);
            match gap.severity {
                GapSeverity::Severe => {
                    tracing::error!(
                        service = %gap.service,
                        key = %gap.key,
                        previous = gap.previous,
                        observed = gap.observed,
                        "Account activity sequence gap"
                    );
                    actions.push(DispatchAction::Notify(StreamNotification::MissSequence));
                }
                GapSeverity::Soft => {
                    tracing::warn!(
                        service = %gap.service,
                        key = %gap.key,
                        previous = gap.previous,
                        observed = gap.observed,
                        "Sequence gap"
                    );
                    soft_gap = true;
                }
            }
        }

        let count = segregated.records.len() as u64;
        if count > 0 {
            metrics::record_records(&segregated.service, count);
            let dropped = self.buffer.append(&segregated.service, segregated.records);
            if dropped > 0 {
                tracing::warn!(
                    service = %segregated.service,
                    dropped,
                    "Record buffer full, oldest records dropped"
                );
                metrics::record_records_dropped(&segregated.service, dropped as u64);
            }
        }
        soft_gap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::Service;
    use crate::domain::subscription::{SubscriptionCommand, SubscriptionRegistry};
    use crate::domain::time::SessionClock;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        buffer: Arc<RecordBuffer>,
        diagnostics: Arc<SessionDiagnostics>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let buffer = Arc::new(RecordBuffer::new());
        let diagnostics = Arc::new(SessionDiagnostics::new(4));
        let dispatcher = Dispatcher::new(
            Segregator::new(SessionClock::from_offsets(0, -5)),
            GapDetector::new(Arc::clone(&registry)),
            Arc::clone(&buffer),
            Arc::clone(&diagnostics),
        );
        Fixture {
            registry,
            buffer,
            diagnostics,
            dispatcher,
        }
    }

    fn subscribe(registry: &SubscriptionRegistry, service: &Service, key: &str) {
        registry.apply(
            service,
            SubscriptionCommand::Subs,
            &[key.to_string()],
            &service.default_fields(),
        );
    }

    fn activity_frame(seq: u64) -> String {
        format!(
            r#"{{"data":[{{"service":"ACCT_ACTIVITY","timestamp":1,"command":"SUBS",
                "content":[{{"key":"sub-key","seq":{seq},"1":"","2":"SUBSCRIBED","3":""}}]}}]}}"#
        )
    }

    fn quote_frame(seq: u64) -> String {
        format!(
            r#"{{"data":[{{"service":"QUOTE","timestamp":1,"command":"SUBS",
                "content":[{{"key":"AAPL","seq":{seq},"1":121.5}}]}}]}}"#
        )
    }

    #[test]
    fn login_accepted_and_rejected() {
        let f = fixture();
        let ok = f.dispatcher.on_message(
            r#"{"response":[{"service":"ADMIN","requestid":"0","command":"LOGIN","timestamp":1,"content":{"code":0,"msg":"29-3"}}]}"#,
        );
        assert_eq!(ok, vec![DispatchAction::LoginAccepted]);

        let denied = f.dispatcher.on_message(
            r#"{"response":[{"service":"ADMIN","requestid":"0","command":"LOGIN","timestamp":1,"content":{"code":3,"msg":"Login Denied"}}]}"#,
        );
        assert_eq!(
            denied,
            vec![DispatchAction::LoginRejected {
                code: 3,
                message: "Login Denied".to_string()
            }]
        );
        assert_eq!(f.diagnostics.responses().len(), 2);
    }

    #[test]
    fn heartbeat_updates_last_heartbeat_only() {
        let f = fixture();
        let actions = f
            .dispatcher
            .on_message(r#"{"notify":[{"heartbeat":"1614612600000"}]}"#);
        assert!(actions.is_empty());
        assert_eq!(f.diagnostics.last_heartbeat(), Some(1_614_612_600_000));
        assert!(f.diagnostics.notifications().is_empty());
    }

    #[test]
    fn diagnostics_are_bounded() {
        let f = fixture();
        for n in 0..6 {
            f.dispatcher
                .on_message(&format!(r#"{{"snapshot":[{{"n":{n}}}]}}"#));
        }
        let snapshots = f.diagnostics.snapshots();
        assert_eq!(snapshots.len(), 4);
        assert_eq!(snapshots[0]["n"], 2);
    }

    #[test]
    fn undecodable_frame_is_dropped() {
        let f = fixture();
        assert!(f.dispatcher.on_message("{broken").is_empty());
    }

    #[test]
    fn data_is_buffered_and_observers_notified_once() {
        let f = fixture();
        subscribe(&f.registry, &Service::Quote, "AAPL");

        let actions = f.dispatcher.on_message(&quote_frame(1));
        assert_eq!(actions, vec![DispatchAction::Notify(StreamNotification::Frame)]);
        assert_eq!(f.buffer.pending(&Service::Quote), 1);
    }

    #[test]
    fn severe_gap_notifies_miss_sequence() {
        let f = fixture();
        subscribe(&f.registry, &Service::AcctActivity, "sub-key");

        f.dispatcher.on_message(&activity_frame(10));
        let actions = f.dispatcher.on_message(&activity_frame(12));
        assert_eq!(
            actions,
            vec![
                DispatchAction::Notify(StreamNotification::MissSequence),
                DispatchAction::Notify(StreamNotification::Frame),
            ]
        );
        assert_eq!(f.buffer.pending(&Service::AcctActivity), 2);
    }

    #[test]
    fn soft_gap_requests_ping_and_resubscribe() {
        let f = fixture();
        subscribe(&f.registry, &Service::Quote, "AAPL");

        f.dispatcher.on_message(&quote_frame(1));
        let actions = f.dispatcher.on_message(&quote_frame(5));
        assert_eq!(
            actions,
            vec![
                DispatchAction::SendQosPing,
                DispatchAction::ResubscribeAccountActivity,
                DispatchAction::Notify(StreamNotification::Frame),
            ]
        );
        assert_eq!(
            f.registry.get(&Service::Quote).unwrap().cursor("AAPL"),
            Some(Some(5))
        );
    }

    #[test]
    fn consecutive_sequences_raise_nothing() {
        let f = fixture();
        subscribe(&f.registry, &Service::AcctActivity, "sub-key");

        for seq in 7..12 {
            let actions = f.dispatcher.on_message(&activity_frame(seq));
            assert_eq!(actions, vec![DispatchAction::Notify(StreamNotification::Frame)]);
        }
    }

    #[test]
    fn qos_response_records_round_trip() {
        let f = fixture();
        f.diagnostics.mark_qos_sent();
        let actions = f.dispatcher.on_message(
            r#"{"response":[{"service":"ADMIN","requestid":"2","command":"QOS","timestamp":1,"content":{"code":0,"msg":"QoS command succeeded"}}]}"#,
        );
        assert!(actions.is_empty());
        assert!(f.diagnostics.last_ping_rtt().is_some());
    }

    #[test]
    fn untracked_key_is_buffered_without_gap_checks() {
        let f = fixture();
        subscribe(&f.registry, &Service::Quote, "MSFT");

        for seq in [3, 9] {
            let actions = f.dispatcher.on_message(&quote_frame(seq));
            assert_eq!(actions, vec![DispatchAction::Notify(StreamNotification::Frame)]);
        }

        assert_eq!(f.diagnostics.untracked_sequences(), 2);
        assert_eq!(f.buffer.pending(&Service::Quote), 2);
        assert_eq!(f.registry.get(&Service::Quote).unwrap().cursor("AAPL"), None);
    }

    #[test]
    fn full_buffer_keeps_newest_records() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let buffer = Arc::new(RecordBuffer::with_capacity(2));
        let dispatcher = Dispatcher::new(
            Segregator::new(SessionClock::from_offsets(0, -5)),
            GapDetector::new(Arc::clone(&registry)),
            Arc::clone(&buffer),
            Arc::new(SessionDiagnostics::new(4)),
        );
        subscribe(&registry, &Service::Quote, "AAPL");

        for seq in 1..=5 {
            dispatcher.on_message(&quote_frame(seq));
        }

        assert_eq!(buffer.pending(&Service::Quote), 2);
        assert_eq!(buffer.dropped_total(&Service::Quote), 3);
        assert_eq!(buffer.appended_total(&Service::Quote), 5);
    }
}
