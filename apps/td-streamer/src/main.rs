//! TD Streamer Binary
//!
//! Logs in to the streamer, applies the configured subscriptions and
//! persists incoming data until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin td-streamer
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `TD_CLIENT_ID`: OAuth client id
//! - `TD_REFRESH_TOKEN`: OAuth refresh token
//!
//! ## Optional
//! - `TD_ACCOUNT_ID`: Account to stream for (default: first account)
//! - `TD_API_BASE_URL`: REST base URL
//! - `TD_SUBSCRIPTIONS`: e.g. `CHART_EQUITY=SPY,AAPL;TIMESALE_EQUITY=SPY`
//! - `TD_DATA_DIR`: CSV output directory (default: ./StreamData)
//! - `TD_CACHE_ENABLED`: Persist records (default: true)
//! - `TD_QOS_LEVEL`: 0 (express) to 5 (delayed), default 2
//! - `TD_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log filter (default: td_streamer=info)

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use td_streamer::infrastructure::health::{HealthServer, HealthServerState};
use td_streamer::infrastructure::telemetry;
use td_streamer::{
    ClientConfig, CsvSink, HttpCredentialSupplier, QosLevel, SessionClock, SharedSink,
    StreamError, StreamNotification, StreamerConfig, StreamingClient, TcpProbe, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting TD Streamer");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = StreamerConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let mut supplier = HttpCredentialSupplier::new(
        config.api_base_url.clone(),
        config.credentials.client_id(),
        config.credentials.refresh_token(),
    )?;
    if let Some(account_id) = &config.account_id {
        supplier = supplier.with_account(account_id.clone());
    }

    let probe = TcpProbe::new(
        config.recovery.probe_addr.clone(),
        config.recovery.probe_timeout,
    );

    let sink: Option<SharedSink> = config.storage.cache_enabled.then(|| {
        let sink: SharedSink = Arc::new(Mutex::new(CsvSink::new(config.storage.data_dir.clone())));
        sink
    });

    let client_config = ClientConfig {
        login_timeout: config.session.login_timeout,
        heartbeat: config.heartbeat(),
        supervisor: config.recovery.supervisor(),
        clock: SessionClock::measure(config.session.reference_utc_offset_hours),
        ..ClientConfig::default()
    };
    let client = StreamingClient::new(
        Arc::new(supplier),
        Arc::new(probe),
        sink.clone(),
        client_config,
    );

    client.register_observer(|notification| {
        if notification == StreamNotification::MissSequence {
            tracing::warn!("Account activity sequence missed; account state should be reloaded");
        }
    });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        client.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Initial login, retried while failures are transient
    let startup_client = client.clone();
    let startup_token = shutdown_token.clone();
    let retry_delay = config.recovery.probe_interval;
    let subscriptions = config.subscriptions.clone();
    let qos = config.session.qos;
    let startup = tokio::spawn(async move {
        tokio::select! {
            () = startup_token.cancelled() => Ok(()),
            result = start_session(&startup_client, &subscriptions, qos, retry_delay) => result,
        }
    });

    let startup_failure = tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => None,
        joined = startup => match joined {
            Ok(Err(e)) => Some(e),
            Ok(Ok(())) => {
                await_shutdown(shutdown_token.clone()).await;
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Startup task failed");
                await_shutdown(shutdown_token.clone()).await;
                None
            }
        },
    };

    if let Some(e) = &startup_failure {
        tracing::error!(error = %e, kind = e.kind(), "Login cannot succeed, shutting down");
        shutdown_token.cancel();
    }

    client.shutdown().await;
    if let Some(sink) = sink {
        wait_for_sink(&sink).await;
    }

    if let Some(e) = startup_failure {
        return Err(e.into());
    }

    tracing::info!("TD Streamer stopped");
    Ok(())
}

/// Log in, then apply startup QoS and subscriptions.
///
/// Transient failures are retried; credential and login rejections are
/// returned.
async fn start_session(
    client: &StreamingClient,
    subscriptions: &[(td_streamer::Service, Vec<td_streamer::Key>)],
    qos: QosLevel,
    retry_delay: Duration,
) -> Result<(), StreamError> {
    loop {
        match client.connect().await {
            Ok(()) => break,
            Err(StreamError::Shutdown) => return Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::error!(error = %e, retry_ms = retry_delay.as_millis(), "Login failed");
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }

    if qos != QosLevel::default()
        && let Err(e) = client.qos(qos).await
    {
        tracing::warn!(error = %e, level = qos.code(), "Cannot set QoS");
    }

    for (service, keys) in subscriptions {
        match client.subscribe(service.clone(), keys).await {
            Ok(applied) => tracing::info!(
                service = %service,
                keys = applied.keys.len(),
                "Startup subscription applied"
            ),
            Err(e) => tracing::error!(service = %service, error = %e, "Startup subscription failed"),
        }
    }
    Ok(())
}

/// Wait until the cache flusher has closed every output.
async fn wait_for_sink(sink: &SharedSink) {
    let closed = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while !sink.lock().open_services().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if closed.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Outputs still open at shutdown"
        );
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &StreamerConfig) {
    tracing::info!(
        api_base_url = %config.api_base_url,
        health_port = config.server.health_port,
        cache_enabled = config.storage.cache_enabled,
        data_dir = %config.storage.data_dir.display(),
        subscriptions = config.subscriptions.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        probe_addr = %config.recovery.probe_addr,
        probe_interval_ms = config.recovery.probe_interval.as_millis(),
        login_timeout_secs = config.session.login_timeout.map(|t| t.as_secs()),
        "Session settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
