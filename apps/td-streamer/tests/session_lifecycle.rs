//! Session Lifecycle Integration Tests
//!
//! Runs the streaming client against an in-process WebSocket streamer and
//! checks login, subscription commands, recovery after an unexpected close
//! and logout.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use td_streamer::infrastructure::streamer::{ReconnectConfig, SupervisorConfig};
use td_streamer::{
    AlwaysReachable, ClientConfig, CredentialError, CredentialSupplier, Service, SessionClock,
    SessionState, StreamError, StreamNotification, StreamingClient, StreamingCredentials,
};

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Fake Streamer
// =============================================================================

#[derive(Debug)]
enum ServerCommand {
    Send(String),
    Close,
}

/// Request received by the fake streamer, tagged with its connection number.
#[derive(Debug, Clone)]
struct Received {
    connection: usize,
    request: Value,
}

impl Received {
    fn service(&self) -> &str {
        self.request["service"].as_str().unwrap()
    }

    fn command(&self) -> &str {
        self.request["command"].as_str().unwrap()
    }

    fn keys(&self) -> &str {
        self.request["parameters"]["keys"].as_str().unwrap()
    }
}

struct FakeStreamer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Received>,
    controls: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerCommand>>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeStreamer {
    async fn start(login_code: i64) -> Self {
        Self::start_with(login_code, usize::MAX).await
    }

    /// Only the first `answered` connections get a LOGIN reply.
    async fn start_with(login_code: i64, answered: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let controls = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_controls = Arc::clone(&controls);
        let accept_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = accept_connections.fetch_add(1, Ordering::SeqCst) + 1;
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                accept_controls.lock().push(control_tx);
                tokio::spawn(serve_connection(
                    stream,
                    connection,
                    (connection <= answered).then_some(login_code),
                    control_rx,
                    received_tx.clone(),
                ));
            }
        });

        Self {
            addr,
            received,
            controls,
            connections,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Control channel of connection `n` (1-based).
    fn control(&self, n: usize) -> mpsc::UnboundedSender<ServerCommand> {
        self.controls.lock()[n - 1].clone()
    }

    /// Next request matching `predicate`, skipping others.
    async fn wait_for<F>(&mut self, predicate: F) -> Received
    where
        F: Fn(&Received) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let received = self.received.recv().await.unwrap();
                if predicate(&received) {
                    return received;
                }
            }
        })
        .await
        .expect("request not received in time")
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    connection: usize,
    login_code: Option<i64>,
    mut control_rx: mpsc::UnboundedReceiver<ServerCommand>,
    received_tx: mpsc::UnboundedSender<Received>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            command = control_rx.recv() => match command {
                Some(ServerCommand::Send(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    for request in frame["requests"].as_array().cloned().unwrap_or_default() {
                        if request["command"] == "LOGIN"
                            && let Some(login_code) = login_code
                        {
                            let reply = json!({"response": [{
                                "service": "ADMIN",
                                "requestid": "0",
                                "command": "LOGIN",
                                "timestamp": 1_616_000_000_000_i64,
                                "content": {"code": login_code, "msg": "login"}
                            }]});
                            let _ = write.send(Message::Text(reply.to_string().into())).await;
                        }
                        let _ = received_tx.send(Received { connection, request });
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// =============================================================================
// Fake Credentials
// =============================================================================

struct FakeCredentials {
    url: String,
    issued: AtomicUsize,
}

impl FakeCredentials {
    fn new(url: String) -> Self {
        Self {
            url,
            issued: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CredentialSupplier for FakeCredentials {
    async fn streaming_credentials(&self) -> Result<StreamingCredentials, CredentialError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(StreamingCredentials {
            user_id: "111".to_string(),
            token: format!("token-{n}"),
            company: "AMER".to_string(),
            segment: "AMER".to_string(),
            cd_domain: "A000001".to_string(),
            user_group: "ACCT".to_string(),
            access_level: "ACCT".to_string(),
            app_id: "APP1".to_string(),
            acl: "AKBR".to_string(),
            token_timestamp_ms: 1_566_483_863_000,
            socket_url: self.url.clone(),
            subscription_key: format!("sub-key-{n}"),
        })
    }

    async fn bearer_token(&self) -> Result<String, CredentialError> {
        Ok("bearer".to_string())
    }
}

fn client_for(server: &FakeStreamer) -> StreamingClient {
    let config = ClientConfig {
        login_timeout: Some(Duration::from_secs(2)),
        supervisor: SupervisorConfig {
            probe_interval: Duration::from_millis(20),
            reconnect: ReconnectConfig::fixed(Duration::from_millis(50)),
        },
        clock: SessionClock::from_offsets(0, -5),
        ..ClientConfig::default()
    };
    StreamingClient::new(
        Arc::new(FakeCredentials::new(server.url())),
        Arc::new(AlwaysReachable),
        None,
        config,
    )
}

async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    timeout(WAIT, async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("observer not notified");
}

fn quote_frame(seq: u64) -> String {
    json!({"data": [{
        "service": "QUOTE",
        "timestamp": 1_616_000_000_000_i64,
        "command": "SUBS",
        "content": [{"key": "AAPL", "seq": seq, "1": 121.5}]
    }]})
    .to_string()
}

fn activity_frame(key: &str, seq: u64) -> String {
    json!({"data": [{
        "service": "ACCT_ACTIVITY",
        "timestamp": 1_616_000_000_000_i64,
        "command": "SUBS",
        "content": [{"key": key, "seq": seq, "1": "", "2": "SUBSCRIBED", "3": ""}]
    }]})
    .to_string()
}

async fn wait_for_state(client: &StreamingClient, state: SessionState) {
    timeout(WAIT, async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state not reached in time");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_then_subscribe() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    client.connect().await.unwrap();
    assert_eq!(client.state(), SessionState::LoggedIn);

    let login = server.wait_for(|r| r.command() == "LOGIN").await;
    assert_eq!(login.service(), "ADMIN");
    assert_eq!(login.request["requestid"], "0");
    assert_eq!(login.request["parameters"]["token"], "token-1");

    let applied = client
        .subscribe_chart_equity(&["SPY".to_string(), "AAPL".to_string()])
        .await
        .unwrap();
    assert_eq!(applied.request_id, 3);

    let subs = server.wait_for(|r| r.command() == "SUBS").await;
    assert_eq!(subs.service(), "CHART_EQUITY");
    assert_eq!(subs.keys(), "SPY,AAPL");
    assert_eq!(subs.request["requestid"], "3");
    assert_eq!(subs.request["account"], "111");
    assert_eq!(subs.request["source"], "APP1");

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_login_is_reported() {
    let server = FakeStreamer::start(3).await;
    let client = client_for(&server);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, StreamError::LoginRejected { code: 3, .. }));
    assert_eq!(client.state(), SessionState::Disconnected);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_close_recovers_and_replays() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    client.connect().await.unwrap();
    client
        .subscribe_chart_equity(&["SPY".to_string()])
        .await
        .unwrap();
    client.subscribe_account_activity().await.unwrap();
    let activity = server
        .wait_for(|r| r.service() == "ACCT_ACTIVITY" && r.command() == "SUBS")
        .await;
    assert_eq!(activity.keys(), "sub-key-1");

    server.control(1).send(ServerCommand::Close).unwrap();

    let relogin = server
        .wait_for(|r| r.connection == 2 && r.command() == "LOGIN")
        .await;
    assert_eq!(relogin.request["parameters"]["token"], "token-2");

    let chart = server
        .wait_for(|r| r.connection == 2 && r.command() == "SUBS")
        .await;
    assert_eq!(chart.service(), "CHART_EQUITY");
    assert_eq!(chart.keys(), "SPY");

    let activity = server
        .wait_for(|r| r.connection == 2 && r.command() == "SUBS")
        .await;
    assert_eq!(activity.service(), "ACCT_ACTIVITY");
    assert_eq!(activity.keys(), "sub-key-2");

    wait_for_state(&client, SessionState::LoggedIn).await;
    assert_eq!(
        client.registry().active_keys(&Service::AcctActivity),
        vec!["sub-key-2".to_string()]
    );
    assert_eq!(server.connection_count(), 2);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_does_not_reconnect() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    client.connect().await.unwrap();
    client.subscribe_quotes(&["AAPL".to_string()]).await.unwrap();
    client.logout().await.unwrap();

    let logout = server.wait_for(|r| r.command() == "LOGOUT").await;
    assert_eq!(logout.service(), "ADMIN");
    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(client.registry().active_services().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.state(), SessionState::Disconnected);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn data_frames_reach_buffer_and_observers() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    let frames = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&frames);
    client.register_observer(move |notification| {
        if notification == StreamNotification::Frame {
            observed.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.connect().await.unwrap();
    client
        .subscribe_chart_equity(&["SPY".to_string()])
        .await
        .unwrap();
    server.wait_for(|r| r.command() == "SUBS").await;

    let data = json!({"data": [{
        "service": "CHART_EQUITY",
        "timestamp": 1_616_000_000_000_i64,
        "command": "SUBS",
        "content": [{
            "key": "SPY", "seq": 1,
            "1": 390.1, "2": 390.5, "3": 389.9, "4": 390.2, "5": 12000.0,
            "6": 1, "7": 1_616_000_000_000_i64, "8": 18702
        }]
    }]});
    server
        .control(1)
        .send(ServerCommand::Send(data.to_string()))
        .unwrap();

    wait_for_count(&frames, 1).await;

    let records = client.buffer().snapshot(&Service::ChartEquity);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), "SPY");

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_during_relogin_ends_disconnected() {
    let mut server = FakeStreamer::start_with(0, 1).await;
    let client = client_for(&server);

    client.connect().await.unwrap();
    client.subscribe_quotes(&["AAPL".to_string()]).await.unwrap();
    server.wait_for(|r| r.command() == "SUBS").await;

    server.control(1).send(ServerCommand::Close).unwrap();
    server
        .wait_for(|r| r.connection == 2 && r.command() == "LOGIN")
        .await;

    client.logout().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(server.connection_count(), 2);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn market_data_gap_sends_qos_and_activity_resubscribe() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    client.connect().await.unwrap();
    client.subscribe_account_activity().await.unwrap();
    server
        .wait_for(|r| r.service() == "ACCT_ACTIVITY" && r.command() == "SUBS")
        .await;
    client.subscribe_quotes(&["AAPL".to_string()]).await.unwrap();
    server.wait_for(|r| r.service() == "QUOTE").await;

    let control = server.control(1);
    control.send(ServerCommand::Send(quote_frame(1))).unwrap();
    control.send(ServerCommand::Send(quote_frame(4))).unwrap();

    let qos = server.wait_for(|r| r.command() == "QOS").await;
    assert_eq!(qos.service(), "ADMIN");
    assert_eq!(qos.request["parameters"]["qoslevel"], "0");

    let activity = server
        .wait_for(|r| r.service() == "ACCT_ACTIVITY" && r.command() == "SUBS")
        .await;
    assert_eq!(activity.keys(), "sub-key-1");
    assert_eq!(
        client.registry().get(&Service::Quote).unwrap().cursor("AAPL"),
        Some(Some(4))
    );

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn activity_gap_reaches_observers_once() {
    let mut server = FakeStreamer::start(0).await;
    let client = client_for(&server);

    let misses = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&misses);
    client.register_observer(move |notification| {
        if notification == StreamNotification::MissSequence {
            observed.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.connect().await.unwrap();
    client.subscribe_account_activity().await.unwrap();
    server
        .wait_for(|r| r.service() == "ACCT_ACTIVITY" && r.command() == "SUBS")
        .await;

    let control = server.control(1);
    control.send(ServerCommand::Send(activity_frame("sub-key-1", 5))).unwrap();
    control.send(ServerCommand::Send(activity_frame("sub-key-1", 7))).unwrap();

    wait_for_count(&misses, 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert_eq!(
        client
            .registry()
            .get(&Service::AcctActivity)
            .unwrap()
            .cursor("sub-key-1"),
        Some(Some(7))
    );

    client.shutdown().await;
}
