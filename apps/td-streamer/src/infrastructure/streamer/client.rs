//! Streaming Client
//!
//! Owns the streaming session: one WebSocket transport at a time, the
//! subscription registry that outlives it, and the background tasks that
//! run while it is logged in.
//!
//! # Tasks
//!
//! - connection task: reads frames, drives the dispatcher, writes queued
//!   commands and heartbeat pings
//! - download rate sampler and cache flusher: started on LOGIN success,
//!   stopped when the connection ends
//! - reconnect supervisor: started by the first `connect()`, restores the
//!   session after an unexpected close
//!
//! Commands are queued on an unbounded channel drained by the connection
//! task, so sending never blocks the caller on the socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CredentialSupplier, NetworkProbe, SharedSink};
use crate::application::services::{ObserverRegistry, StreamNotification};
use crate::domain::records::{DEFAULT_BUFFER_CAPACITY, RecordBuffer};
use crate::domain::sequence::GapDetector;
use crate::domain::service::{QosLevel, Service};
use crate::domain::session::{SessionState, StreamingCredentials};
use crate::domain::subscription::{AppliedCommand, Key, SubscriptionCommand, SubscriptionRegistry};
use crate::domain::time::SessionClock;
use crate::infrastructure::metrics;
use crate::infrastructure::persistence::CacheFlusher;

use super::dispatcher::{DEFAULT_DIAGNOSTICS_CAPACITY, DispatchAction, Dispatcher, SessionDiagnostics};
use super::error::StreamError;
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::ResponseMessage;
use super::protocol::{ChartHistoryQuery, CommandBuilder, Request, encode};
use super::rate::DownloadRate;
use super::segregator::Segregator;
use super::supervisor::{ConnectionLost, ReconnectSupervisor, SessionControl, SupervisorConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Default wait for the LOGIN response.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Wait for the LOGIN response; `None` waits until the connection ends.
    pub login_timeout: Option<Duration>,
    /// Ping cadence and liveness timeout.
    pub heartbeat: HeartbeatConfig,
    /// Recovery timing.
    pub supervisor: SupervisorConfig,
    /// Responses, notices and snapshots kept for inspection.
    pub diagnostics_capacity: usize,
    /// Records kept per service between flushes.
    pub buffer_capacity: usize,
    /// Split data into typed records; otherwise keep everything generic.
    pub segregate: bool,
    /// Timestamp adjustment.
    pub clock: SessionClock,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            login_timeout: Some(DEFAULT_LOGIN_TIMEOUT),
            heartbeat: HeartbeatConfig::default(),
            supervisor: SupervisorConfig::default(),
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            segregate: true,
            clock: SessionClock::default(),
        }
    }
}

/// Live transport and what is needed to speak on it.
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    builder: CommandBuilder,
    credentials: StreamingCredentials,
    cancel: CancellationToken,
    session_tasks: CancellationToken,
    login_tx: Option<oneshot::Sender<Result<(), StreamError>>>,
}

struct ClientInner {
    config: ClientConfig,
    supplier: Arc<dyn CredentialSupplier>,
    probe: Arc<dyn NetworkProbe>,
    sink: Option<SharedSink>,
    registry: Arc<SubscriptionRegistry>,
    buffer: Arc<RecordBuffer>,
    diagnostics: Arc<SessionDiagnostics>,
    dispatcher: Dispatcher,
    observers: ObserverRegistry,
    rate: Arc<DownloadRate>,
    state: RwLock<SessionState>,
    connection: Mutex<Option<Connection>>,
    connect_lock: tokio::sync::Mutex<()>,
    user_logoff: AtomicBool,
    generation: AtomicU64,
    shutdown: CancellationToken,
    lost_tx: mpsc::UnboundedSender<ConnectionLost>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionLost>>>,
}

/// Handle to the streaming session. Cloning shares the session.
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("state", &self.state())
            .field("subscriptions", &self.inner.registry.stats())
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(
        supplier: Arc<dyn CredentialSupplier>,
        probe: Arc<dyn NetworkProbe>,
        sink: Option<SharedSink>,
        config: ClientConfig,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let buffer = Arc::new(RecordBuffer::with_capacity(config.buffer_capacity));
        let diagnostics = Arc::new(SessionDiagnostics::new(config.diagnostics_capacity));
        let dispatcher = Dispatcher::new(
            Segregator::new(config.clock).segregating(config.segregate),
            GapDetector::new(Arc::clone(&registry)),
            Arc::clone(&buffer),
            Arc::clone(&diagnostics),
        );
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ClientInner {
                config,
                supplier,
                probe,
                sink,
                registry,
                buffer,
                diagnostics,
                dispatcher,
                observers: ObserverRegistry::new(),
                rate: Arc::new(DownloadRate::new()),
                state: RwLock::new(SessionState::Disconnected),
                connection: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                user_logoff: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                lost_tx,
                lost_rx: Mutex::new(Some(lost_rx)),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Connect and log in, returning once LOGIN is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `StreamError` if credentials cannot be fetched, the socket
    /// cannot be opened, LOGIN is rejected or the LOGIN response times out.
    pub async fn connect(&self) -> Result<(), StreamError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StreamError::Shutdown);
        }
        self.inner.user_logoff.store(false, Ordering::SeqCst);
        self.start_supervisor();
        self.establish(SessionState::Disconnected).await
    }

    /// Send LOGOUT, close the socket and forget every subscription.
    ///
    /// A logout is never followed by automatic reconnection.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Protocol` if the LOGOUT frame cannot be encoded.
    pub async fn logout(&self) -> Result<(), StreamError> {
        self.inner.user_logoff.store(true, Ordering::SeqCst);
        self.inner.registry.clear();

        let connection = self.inner.connection.lock().take();
        let mut result = Ok(());
        if let Some(mut connection) = connection {
            tracing::info!(generation = connection.generation, "Logging out");
            result = encode(&[connection.builder.logout()])
                .map(|frame| {
                    let _ = connection.outbound.send(Message::Text(frame.into()));
                })
                .map_err(StreamError::from);
            let _ = connection.outbound.send(Message::Close(None));
            connection.session_tasks.cancel();
            if let Some(login_tx) = connection.login_tx.take() {
                let _ = login_tx.send(Err(StreamError::ConnectionClosed));
            }
        }
        self.set_state(SessionState::Disconnected);
        tokio::task::yield_now().await;
        result
    }

    /// Log out and stop every background task. The client cannot reconnect.
    pub async fn shutdown(&self) {
        if let Err(e) = self.logout().await {
            tracing::warn!(error = %e, "Logout during shutdown failed");
        }
        self.inner.shutdown.cancel();
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Session state changed");
        }
        metrics::set_session_state(next);
    }

    fn logoff_requested(&self) -> bool {
        self.inner.user_logoff.load(Ordering::SeqCst) || self.inner.shutdown.is_cancelled()
    }

    fn start_supervisor(&self) {
        let Some(lost_rx) = self.inner.lost_rx.lock().take() else {
            return;
        };
        let supervisor = ReconnectSupervisor::new(
            Arc::new(self.clone()),
            Arc::clone(&self.inner.probe),
            self.inner.config.supervisor.clone(),
            self.inner.shutdown.child_token(),
        );
        tokio::spawn(supervisor.run(lost_rx));
    }

    async fn ensure_connected(&self) -> Result<(), StreamError> {
        if self.state().is_logged_in() {
            return Ok(());
        }
        self.connect().await
    }

    /// Open a transport and log in; on failure the state falls back to `fallback`.
    async fn establish(&self, fallback: SessionState) -> Result<(), StreamError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state().is_logged_in() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(StreamError::Shutdown);
        }

        self.set_state(SessionState::Connecting);
        match self.open_session().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Connect failed");
                metrics::record_websocket_error(e.kind());
                self.teardown();
                // A logout during the attempt already settled the state.
                if self.logoff_requested() {
                    self.set_state(SessionState::Disconnected);
                } else {
                    self.set_state(fallback);
                }
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<(), StreamError> {
        let credentials = self.inner.supplier.streaming_credentials().await?;
        tracing::info!(url = %credentials.socket_url, "Connecting to streamer");

        let (socket, _response) =
            tokio_tungstenite::connect_async(credentials.socket_url.as_str()).await?;
        let (write, read) = socket.split();

        let builder = CommandBuilder::new(&credentials);
        let login = encode(&[builder.login(&credentials)?])?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (login_tx, login_rx) = oneshot::channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.inner.shutdown.child_token();

        outbound
            .send(Message::Text(login.into()))
            .map_err(|_| StreamError::ConnectionClosed)?;
        *self.inner.connection.lock() = Some(Connection {
            generation,
            outbound,
            builder,
            credentials,
            cancel: cancel.clone(),
            session_tasks: cancel.child_token(),
            login_tx: Some(login_tx),
        });
        self.set_state(SessionState::AwaitingLoginAck);
        tokio::spawn(
            self.clone()
                .run_connection(generation, write, read, outbound_rx, cancel),
        );

        let outcome = match self.inner.config.login_timeout {
            Some(timeout) => tokio::time::timeout(timeout, login_rx)
                .await
                .map_err(|_| StreamError::LoginTimeout(timeout))?,
            None => login_rx.await,
        };
        outcome.unwrap_or(Err(StreamError::ConnectionClosed))
    }

    /// Drop the current connection without LOGOUT.
    fn teardown(&self) {
        if let Some(connection) = self.inner.connection.lock().take() {
            connection.cancel.cancel();
        }
    }

    // =========================================================================
    // Connection task
    // =========================================================================

    async fn run_connection(
        self,
        generation: u64,
        mut write: WsWrite,
        mut read: WsRead,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        let heartbeat = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(8);
        tokio::spawn(
            HeartbeatManager::new(
                self.inner.config.heartbeat.clone(),
                Arc::clone(&heartbeat),
                heartbeat_tx,
                cancel.child_token(),
            )
            .run(),
        );

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break "cancelled".to_string();
                }
                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            break format!("ping failed: {e}");
                        }
                    }
                    HeartbeatEvent::Timeout => break "heartbeat timeout".to_string(),
                },
                Some(message) = outbound_rx.recv() => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = write.send(message).await {
                        metrics::record_websocket_error("send");
                        break format!("send failed: {e}");
                    }
                    if closing {
                        break "closed by client".to_string();
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat.record_activity();
                        self.inner.rate.add(text.len());
                        self.handle_frame(generation, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        heartbeat.record_activity();
                        self.inner.rate.add(data.len());
                        tracing::debug!(bytes = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat.record_activity();
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break format!("pong failed: {e}");
                        }
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat.record_activity(),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "server closed".to_string(),
                            |frame| format!("server closed: {} {}", frame.code, frame.reason),
                        );
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        metrics::record_websocket_error("receive");
                        break format!("transport error: {e}");
                    }
                    None => break "stream ended".to_string(),
                },
            }
        };

        cancel.cancel();
        self.on_connection_closed(generation, reason);
    }

    fn handle_frame(&self, generation: u64, text: &str) {
        for action in self.inner.dispatcher.on_message(text) {
            match action {
                DispatchAction::LoginAccepted => self.on_login_accepted(generation),
                DispatchAction::LoginRejected { code, message } => {
                    self.resolve_login(generation, Err(StreamError::LoginRejected { code, message }));
                }
                DispatchAction::LogoutAcknowledged => {}
                DispatchAction::Notify(notification) => self.inner.observers.notify(&notification),
                DispatchAction::SendQosPing => {
                    if let Err(e) = self.send_qos(QosLevel::Express) {
                        tracing::warn!(error = %e, "Cannot send QOS ping");
                    }
                }
                DispatchAction::ResubscribeAccountActivity => {
                    if let Err(e) = self.resubscribe_account_activity() {
                        tracing::warn!(error = %e, "Cannot resubscribe account activity");
                    }
                }
            }
        }
    }

    fn on_login_accepted(&self, generation: u64) {
        let mut guard = self.inner.connection.lock();
        let Some(connection) = guard
            .as_mut()
            .filter(|connection| connection.generation == generation)
        else {
            return;
        };

        self.set_state(SessionState::LoggedIn);

        let tasks = connection.session_tasks.clone();
        tokio::spawn(Arc::clone(&self.inner.rate).run(tasks.clone()));
        if let Some(sink) = &self.inner.sink {
            let flusher = Arc::new(CacheFlusher::new(
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.buffer),
                Arc::clone(sink),
                self.inner.config.clock,
            ));
            tokio::spawn(flusher.run(tasks));
        }

        if let Some(login_tx) = connection.login_tx.take() {
            let _ = login_tx.send(Ok(()));
        }
    }

    fn resolve_login(&self, generation: u64, outcome: Result<(), StreamError>) {
        let login_tx = self
            .inner
            .connection
            .lock()
            .as_mut()
            .filter(|connection| connection.generation == generation)
            .and_then(|connection| connection.login_tx.take());
        if let Some(login_tx) = login_tx {
            let _ = login_tx.send(outcome);
        }
    }

    fn on_connection_closed(&self, generation: u64, reason: String) {
        let connection = {
            let mut guard = self.inner.connection.lock();
            if guard
                .as_ref()
                .is_some_and(|connection| connection.generation == generation)
            {
                guard.take()
            } else {
                None
            }
        };
        let Some(mut connection) = connection else {
            tracing::debug!(generation, reason = %reason, "Connection ended");
            return;
        };

        connection.cancel.cancel();
        if let Some(login_tx) = connection.login_tx.take() {
            let _ = login_tx.send(Err(StreamError::ConnectionClosed));
        }

        if !self.state().is_logged_in() {
            tracing::info!(generation, reason = %reason, "Connection closed before login");
            return;
        }

        if self.logoff_requested() {
            tracing::info!(generation, reason = %reason, "Connection closed");
            self.set_state(SessionState::Disconnected);
            return;
        }

        tracing::warn!(generation, reason = %reason, "Connection closed unexpectedly");
        self.set_state(SessionState::Recovering);
        let _ = self.inner.lost_tx.send(ConnectionLost { generation, reason });
    }

    // =========================================================================
    // Sending
    // =========================================================================

    fn builder(&self) -> Result<CommandBuilder, StreamError> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.builder.clone())
            .ok_or(StreamError::ConnectionClosed)
    }

    fn send_requests(&self, requests: &[Request]) -> Result<(), StreamError> {
        let frame = encode(requests)?;
        let guard = self.inner.connection.lock();
        let connection = guard.as_ref().ok_or(StreamError::ConnectionClosed)?;
        connection
            .outbound
            .send(Message::Text(frame.into()))
            .map_err(|_| StreamError::ConnectionClosed)
    }

    fn send_applied(&self, applied: &AppliedCommand) -> Result<(), StreamError> {
        let request = self.builder()?.subscription(applied);
        self.send_requests(&[request])?;
        metrics::set_subscriptions(
            &applied.service,
            self.inner.registry.active_keys(&applied.service).len(),
        );
        tracing::info!(
            service = %applied.service,
            command = applied.command.command().as_str(),
            requestid = applied.request_id,
            keys = applied.keys.len(),
            "Subscription command sent"
        );
        Ok(())
    }

    fn send_qos(&self, level: QosLevel) -> Result<(), StreamError> {
        let request = self.builder()?.qos(level);
        self.inner.diagnostics.mark_qos_sent();
        self.send_requests(&[request])
    }

    fn subscription_key(&self) -> Result<String, StreamError> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|connection| connection.credentials.subscription_key.clone())
            .ok_or(StreamError::ConnectionClosed)
    }

    fn resubscribe_account_activity(&self) -> Result<(), StreamError> {
        let key = self.subscription_key()?;
        let service = Service::AcctActivity;
        let applied = self.inner.registry.apply(
            &service,
            SubscriptionCommand::Subs,
            &[key],
            &service.default_fields(),
        );
        self.send_applied(&applied)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Apply a subscription command locally and send it.
    ///
    /// # Errors
    ///
    /// Returns `StreamError` if the session cannot be connected or the
    /// command cannot be queued.
    pub async fn apply(
        &self,
        service: Service,
        command: SubscriptionCommand,
        keys: &[Key],
        fields: &[u16],
    ) -> Result<AppliedCommand, StreamError> {
        self.ensure_connected().await?;
        let applied = self.inner.registry.apply(&service, command, keys, fields);
        self.send_applied(&applied)?;
        Ok(applied)
    }

    /// SUBS with the service's default fields.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe(&self, service: Service, keys: &[Key]) -> Result<AppliedCommand, StreamError> {
        let fields = service.default_fields();
        self.apply(service, SubscriptionCommand::Subs, keys, &fields)
            .await
    }

    /// ADD keys with the service's default fields.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn add(&self, service: Service, keys: &[Key]) -> Result<AppliedCommand, StreamError> {
        let fields = service.default_fields();
        self.apply(service, SubscriptionCommand::Add, keys, &fields)
            .await
    }

    /// UNSUBS keys.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn unsubscribe(&self, service: Service, keys: &[Key]) -> Result<AppliedCommand, StreamError> {
        self.apply(service, SubscriptionCommand::Unsubs, keys, &[])
            .await
    }

    /// Subscribe to activity for the logged-in accounts.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe_account_activity(&self) -> Result<AppliedCommand, StreamError> {
        self.ensure_connected().await?;
        let key = self.subscription_key()?;
        self.subscribe(Service::AcctActivity, &[key]).await
    }

    /// Subscribe to one-minute equity candles.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe_chart_equity(&self, symbols: &[Key]) -> Result<AppliedCommand, StreamError> {
        self.subscribe(Service::ChartEquity, symbols).await
    }

    /// Subscribe to equity time and sales.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe_timesale_equity(&self, symbols: &[Key]) -> Result<AppliedCommand, StreamError> {
        self.subscribe(Service::TimesaleEquity, symbols).await
    }

    /// Subscribe to the NASDAQ depth book.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe_nasdaq_book(&self, symbols: &[Key]) -> Result<AppliedCommand, StreamError> {
        self.subscribe(Service::NasdaqBook, symbols).await
    }

    /// Subscribe to level one equity quotes.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn subscribe_quotes(&self, symbols: &[Key]) -> Result<AppliedCommand, StreamError> {
        self.subscribe(Service::Quote, symbols).await
    }

    /// Change the update rate.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn qos(&self, level: QosLevel) -> Result<(), StreamError> {
        self.ensure_connected().await?;
        self.send_qos(level)
    }

    /// Request recent headlines for `keys`.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn news_headline_list(&self, keys: &[Key]) -> Result<(), StreamError> {
        self.ensure_connected().await?;
        let request = self.builder()?.news_headline_list(keys);
        self.send_requests(&[request])
    }

    /// Request one news story.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn news_story(&self, story_id: &str) -> Result<(), StreamError> {
        self.ensure_connected().await?;
        let request = self.builder()?.news_story(story_id);
        self.send_requests(&[request])
    }

    /// Request futures candle history.
    ///
    /// # Errors
    ///
    /// See [`StreamingClient::apply`].
    pub async fn chart_history_futures(&self, query: &ChartHistoryQuery) -> Result<(), StreamError> {
        self.ensure_connected().await?;
        let request = self.builder()?.chart_history_futures(query);
        self.send_requests(&[request])
    }

    // =========================================================================
    // Observers and inspection
    // =========================================================================

    /// Register a callback run after each data frame and on severe gaps.
    pub fn register_observer<F>(&self, observer: F)
    where
        F: Fn(StreamNotification) + Send + Sync + 'static,
    {
        self.inner.observers.register(observer);
    }

    /// Subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    /// Per-service record buffers.
    #[must_use]
    pub fn buffer(&self) -> &Arc<RecordBuffer> {
        &self.inner.buffer
    }

    /// Recent responses, oldest first.
    #[must_use]
    pub fn responses(&self) -> Vec<ResponseMessage> {
        self.inner.diagnostics.responses()
    }

    /// Recent non-heartbeat notices, oldest first.
    #[must_use]
    pub fn notifications(&self) -> Vec<serde_json::Value> {
        self.inner.diagnostics.notifications()
    }

    /// Recent GET replies, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<serde_json::Value> {
        self.inner.diagnostics.snapshots()
    }

    /// Server time of the last heartbeat.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<i64> {
        self.inner.diagnostics.last_heartbeat()
    }

    /// Round trip of the last QOS request.
    #[must_use]
    pub fn last_ping_rtt(&self) -> Option<Duration> {
        self.inner.diagnostics.last_ping_rtt()
    }

    /// Inbound bytes during the last second.
    #[must_use]
    pub fn download_rate(&self) -> u64 {
        self.inner.rate.bytes_per_second()
    }
}

#[async_trait]
impl SessionControl for StreamingClient {
    fn user_logged_off(&self) -> bool {
        self.logoff_requested()
    }

    fn is_logged_in(&self) -> bool {
        self.state().is_logged_in()
    }

    fn mark_recovering(&self) {
        self.set_state(SessionState::Recovering);
    }

    async fn reestablish(&self) -> Result<(), StreamError> {
        self.establish(SessionState::Recovering).await
    }

    async fn replay_subscriptions(&self) -> Result<usize, StreamError> {
        let subscriptions = self.inner.registry.active_subscriptions();
        for (service, subscription) in &subscriptions {
            // The account activity key is issued per session.
            let keys = if *service == Service::AcctActivity {
                vec![self.subscription_key()?]
            } else {
                subscription.keys()
            };
            let applied = self.inner.registry.apply(
                service,
                SubscriptionCommand::Subs,
                &keys,
                subscription.fields(),
            );
            self.send_applied(&applied)?;
        }
        Ok(subscriptions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{AlwaysReachable, CredentialError, MockCredentialSupplier};

    fn client(supplier: MockCredentialSupplier) -> StreamingClient {
        StreamingClient::new(
            Arc::new(supplier),
            Arc::new(AlwaysReachable),
            None,
            ClientConfig {
                clock: SessionClock::from_offsets(0, -5),
                ..ClientConfig::default()
            },
        )
    }

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.login_timeout, Some(Duration::from_secs(30)));
        assert!(config.segregate);
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.supervisor.reconnect.initial_delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn credential_failure_surfaces_and_resets_state() {
        let mut supplier = MockCredentialSupplier::new();
        supplier.expect_streaming_credentials().returning(|| {
            Err(CredentialError::RefreshFailed {
                message: "invalid_grant".to_string(),
            })
        });
        let client = client(supplier);

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::Auth(_)));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_connect_first() {
        let mut supplier = MockCredentialSupplier::new();
        supplier.expect_streaming_credentials().times(1).returning(|| {
            Err(CredentialError::RequestFailed {
                message: "offline".to_string(),
            })
        });
        let client = client(supplier);

        let err = client
            .subscribe(Service::Quote, &["AAPL".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert!(!client.registry().is_active(&Service::Quote));
    }

    #[tokio::test]
    async fn logout_without_connection_is_clean() {
        let client = client(MockCredentialSupplier::new());
        client.logout().await.unwrap();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(client.user_logged_off());
    }

    #[tokio::test]
    async fn shutdown_blocks_connect() {
        let client = client(MockCredentialSupplier::new());
        client.shutdown().await;
        assert!(matches!(client.connect().await, Err(StreamError::Shutdown)));
    }
}
