//! Record Persistence
//!
//! `CsvSink` writes one CSV file per service and session day under a data
//! directory. `CacheFlusher` moves buffered records into the sink once per
//! second while the session is logged in, opening outputs for newly active
//! services, rotating them when the session day changes and closing those
//! whose subscriptions were dropped.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{RecordSink, SharedSink, SinkError};
use crate::domain::records::{DataRecord, RecordBuffer};
use crate::domain::service::Service;
use crate::domain::subscription::SubscriptionRegistry;
use crate::domain::time::SessionClock;
use crate::infrastructure::metrics;

/// Default flush period.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// CSV Sink
// =============================================================================

struct CsvOutput {
    day: NaiveDate,
    path: PathBuf,
    writer: csv::Writer<File>,
    needs_header: bool,
}

/// Per-service, per-day CSV files.
pub struct CsvSink {
    dir: PathBuf,
    outputs: IndexMap<Service, CsvOutput>,
}

impl std::fmt::Debug for CsvSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvSink")
            .field("dir", &self.dir)
            .field("open", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CsvSink {
    /// Sink writing under `dir`; the directory is created on first open.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            outputs: IndexMap::new(),
        }
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for `service` on `day`.
    #[must_use]
    pub fn path_for(&self, service: &Service, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.csv", service.as_str(), day.format("%Y-%m-%d")))
    }

    /// Day the open output of `service` belongs to.
    #[must_use]
    pub fn open_day(&self, service: &Service) -> Option<NaiveDate> {
        self.outputs.get(service).map(|output| output.day)
    }

    fn io(service: &Service) -> impl FnOnce(std::io::Error) -> SinkError + '_ {
        move |source| SinkError::Io {
            service: service.as_str().to_string(),
            source,
        }
    }

    fn encode(service: &Service, error: &csv::Error) -> SinkError {
        SinkError::Encode {
            service: service.as_str().to_string(),
            message: error.to_string(),
        }
    }
}

impl RecordSink for CsvSink {
    fn open(&mut self, service: &Service, day: NaiveDate) -> Result<(), SinkError> {
        match self.open_day(service) {
            Some(open) if open == day => return Ok(()),
            Some(_) => return self.rotate(service, day),
            None => {}
        }

        fs::create_dir_all(&self.dir).map_err(Self::io(service))?;
        let path = self.path_for(service, day);
        let is_new = !fs::metadata(&path).is_ok_and(|meta| meta.len() > 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Self::io(service))?;

        tracing::info!(service = %service, path = %path.display(), is_new, "Opened output");
        self.outputs.insert(
            service.clone(),
            CsvOutput {
                day,
                path,
                writer: csv::WriterBuilder::new()
                    .has_headers(false)
                    .from_writer(file),
                needs_header: is_new,
            },
        );
        Ok(())
    }

    fn append(&mut self, service: &Service, records: &[DataRecord]) -> Result<(), SinkError> {
        let output = self
            .outputs
            .get_mut(service)
            .ok_or_else(|| SinkError::NotOpen {
                service: service.as_str().to_string(),
            })?;
        let Some(first) = records.first() else {
            return Ok(());
        };

        if output.needs_header {
            output
                .writer
                .write_record(first.headers())
                .map_err(|e| Self::encode(service, &e))?;
            output.needs_header = false;
        }
        for record in records {
            output
                .writer
                .write_record(record.to_row())
                .map_err(|e| Self::encode(service, &e))?;
        }
        output.writer.flush().map_err(Self::io(service))
    }

    fn rotate(&mut self, service: &Service, day: NaiveDate) -> Result<(), SinkError> {
        if let Some(previous) = self.open_day(service) {
            tracing::info!(service = %service, from = %previous, to = %day, "Rotating output");
        }
        self.close(service)?;
        self.open(service, day)
    }

    fn close(&mut self, service: &Service) -> Result<(), SinkError> {
        let Some(mut output) = self.outputs.shift_remove(service) else {
            return Ok(());
        };
        tracing::info!(service = %service, path = %output.path.display(), "Closed output");
        output.writer.flush().map_err(Self::io(service))
    }

    fn open_services(&self) -> Vec<Service> {
        self.outputs.keys().cloned().collect()
    }
}

// =============================================================================
// Cache Flusher
// =============================================================================

/// Drains buffered records into a [`RecordSink`].
pub struct CacheFlusher {
    registry: Arc<SubscriptionRegistry>,
    buffer: Arc<RecordBuffer>,
    sink: SharedSink,
    clock: SessionClock,
    days: Mutex<IndexMap<Service, NaiveDate>>,
}

impl CacheFlusher {
    /// Create a flusher.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        buffer: Arc<RecordBuffer>,
        sink: SharedSink,
        clock: SessionClock,
    ) -> Self {
        Self {
            registry,
            buffer,
            sink,
            clock,
            days: Mutex::new(IndexMap::new()),
        }
    }

    /// One pass for session day `today`; returns the records written.
    pub fn flush_once(&self, today: NaiveDate) -> usize {
        let active = self.registry.active_services();
        let mut sink = self.sink.lock();
        let mut days = self.days.lock();

        for service in &active {
            let result = match days.get(service) {
                Some(day) if *day == today && sink.is_open(service) => continue,
                Some(_) if sink.is_open(service) => sink.rotate(service, today),
                _ => sink.open(service, today),
            };
            match result {
                Ok(()) => {
                    days.insert(service.clone(), today);
                }
                Err(e) => tracing::warn!(service = %service, error = %e, "Cannot open output"),
            }
        }

        let mut written = 0;
        for service in sink.open_services() {
            let records = self.buffer.drain(&service);
            if records.is_empty() {
                continue;
            }
            match sink.append(&service, &records) {
                Ok(()) => {
                    written += records.len();
                    metrics::record_persisted(&service, records.len() as u64);
                }
                Err(e) => tracing::warn!(
                    service = %service,
                    dropped = records.len(),
                    error = %e,
                    "Cannot persist records"
                ),
            }
        }

        for service in sink.open_services() {
            if active.contains(&service) {
                continue;
            }
            if let Err(e) = sink.close(&service) {
                tracing::warn!(service = %service, error = %e, "Cannot close output");
            }
            days.shift_remove(&service);
        }

        written
    }

    /// Write what is left and close every output.
    pub fn close_all(&self) -> usize {
        let mut written = 0;
        let mut sink = self.sink.lock();
        for service in sink.open_services() {
            let records = self.buffer.drain(&service);
            if !records.is_empty() {
                match sink.append(&service, &records) {
                    Ok(()) => {
                        written += records.len();
                        metrics::record_persisted(&service, records.len() as u64);
                    }
                    Err(e) => tracing::warn!(service = %service, error = %e, "Cannot persist records"),
                }
            }
            if let Err(e) = sink.close(&service) {
                tracing::warn!(service = %service, error = %e, "Cannot close output");
            }
        }
        self.days.lock().clear();
        written
    }

    /// Flush every [`FLUSH_INTERVAL`] until cancelled, then close all outputs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let flusher = Arc::clone(&self);
                    let today = self.clock.today();
                    match tokio::task::spawn_blocking(move || flusher.flush_once(today)).await {
                        Ok(written) if written > 0 => tracing::trace!(written, "Flushed records"),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Flush task failed");
                            break;
                        }
                    }
                }
            }
        }

        let flusher = Arc::clone(&self);
        match tokio::task::spawn_blocking(move || flusher.close_all()).await {
            Ok(written) => tracing::debug!(written, "Cache flusher stopped"),
            Err(e) => tracing::error!(error = %e, "Final flush failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::NaiveDateTime;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::records::ChartRecord;
    use crate::domain::subscription::SubscriptionCommand;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    fn candle(symbol: &str) -> DataRecord {
        let time = NaiveDateTime::parse_from_str("2021-03-01 10:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        DataRecord::Chart(ChartRecord {
            time,
            symbol: symbol.to_string(),
            sequence: Some(1),
            open: Decimal::from_str("1.5").unwrap(),
            high: Decimal::from(2),
            low: Decimal::from(1),
            close: Decimal::from(2),
            volume: Decimal::from(100),
            last_sequence: Some(1),
            chart_day: Some(18_687),
            message_timestamp: 1,
        })
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn header_is_written_once_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path());
        let service = Service::ChartEquity;

        sink.open(&service, day(1)).unwrap();
        sink.append(&service, &[candle("SPY")]).unwrap();
        sink.close(&service).unwrap();

        sink.open(&service, day(1)).unwrap();
        sink.append(&service, &[candle("AAPL")]).unwrap();
        sink.close(&service).unwrap();

        let path = dir.path().join("CHART_EQUITY_2021-03-01.csv");
        let lines = lines(&path);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("datetime,symbol,sequence"));
        assert!(lines[1].contains(",SPY,"));
        assert!(lines[2].contains(",AAPL,"));
    }

    #[test]
    fn append_requires_open_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path());
        let err = sink
            .append(&Service::Quote, &[candle("SPY")])
            .unwrap_err();
        assert!(matches!(err, SinkError::NotOpen { .. }));
    }

    #[test]
    fn rotate_switches_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path().join("nested"));
        let service = Service::ChartEquity;

        sink.open(&service, day(1)).unwrap();
        sink.rotate(&service, day(2)).unwrap();
        sink.append(&service, &[candle("SPY")]).unwrap();

        assert_eq!(sink.open_day(&service), Some(day(2)));
        assert!(sink.path_for(&service, day(1)).exists());
        assert_eq!(lines(&sink.path_for(&service, day(2))).len(), 2);
    }

    #[test]
    fn flusher_opens_drains_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());
        let buffer = Arc::new(RecordBuffer::new());
        let sink: SharedSink = Arc::new(Mutex::new(CsvSink::new(dir.path())));
        let flusher = CacheFlusher::new(
            Arc::clone(&registry),
            Arc::clone(&buffer),
            Arc::clone(&sink),
            SessionClock::from_offsets(0, -5),
        );
        let service = Service::ChartEquity;

        registry.apply(&service, SubscriptionCommand::Subs, &["SPY".to_string()], &[]);
        buffer.append(&service, vec![candle("SPY"), candle("SPY")]);
        assert_eq!(flusher.flush_once(day(1)), 2);
        assert_eq!(buffer.pending(&service), 0);
        assert!(sink.lock().is_open(&service));

        buffer.append(&service, vec![candle("SPY")]);
        assert_eq!(flusher.flush_once(day(2)), 1);
        assert!(dir.path().join("CHART_EQUITY_2021-03-02.csv").exists());

        registry.apply(&service, SubscriptionCommand::Unsubs, &["SPY".to_string()], &[]);
        buffer.append(&service, vec![candle("SPY")]);
        assert_eq!(flusher.flush_once(day(2)), 1);
        assert!(!sink.lock().is_open(&service));
    }

    #[tokio::test]
    async fn run_closes_outputs_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SubscriptionRegistry::new());
        let buffer = Arc::new(RecordBuffer::new());
        let sink: SharedSink = Arc::new(Mutex::new(CsvSink::new(dir.path())));
        let flusher = Arc::new(CacheFlusher::new(
            Arc::clone(&registry),
            Arc::clone(&buffer),
            Arc::clone(&sink),
            SessionClock::from_offsets(0, -5),
        ));

        registry.apply(&Service::Quote, SubscriptionCommand::Subs, &["AAPL".to_string()], &[]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&flusher).run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !sink.lock().is_open(&Service::Quote) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert!(sink.lock().open_services().is_empty());
    }
}
