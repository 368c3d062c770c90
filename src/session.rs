use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::ReadingStore,
    error::{TransportError, TransportResult},
    protocol::{self, LineAssembler},
    sink_debug, sink_error, sink_info, sink_warn,
    transport::Transport,
    utils::logging::{LogSink, SharedLog},
};

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub request_interval: Duration,
    /// Upper bound on how long `disconnect` waits for each background task.
    pub shutdown_grace: Duration,
    /// Read timeout of the listener's handle. Bounds how long the listener
    /// takes to notice a disconnect.
    pub listen_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
            listen_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Terminal. A new connection means a new session.
    Disconnected,
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    requests_sent: AtomicU64,
    lines_ignored: AtomicU64,
    parse_attempts: AtomicU64,
    parse_failures: AtomicU64,
    readings_persisted: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests_sent: u64,
    pub lines_ignored: u64,
    pub parse_attempts: u64,
    pub parse_failures: u64,
    pub readings_persisted: u64,
    pub store_failures: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            lines_ignored: self.lines_ignored.load(Ordering::Relaxed),
            parse_attempts: self.parse_attempts.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            readings_persisted: self.readings_persisted.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn Transport>>>>;

fn lock_writer(writer: &SharedWriter) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
    match writer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A confirmed connection being polled.
///
/// Three activities run until `disconnect`: the requester task writing a
/// request frame every interval, a blocking reader turning port bytes into
/// lines, and an ingest task parsing and storing those lines in order. They
/// share nothing but the cancellation token (cancelled == Disconnected) and
/// the lock around the write handle.
pub struct PollingSession {
    port: String,
    token: CancellationToken,
    writer: SharedWriter,
    requester: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    ingest: Option<JoinHandle<()>>,
    stats: Arc<ListenerStats>,
    settings: SessionSettings,
    log: SharedLog,
}

impl PollingSession {
    /// Take ownership of an open transport and start polling it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Box<dyn Transport>,
        store: ReadingStore,
        settings: SessionSettings,
        log: SharedLog,
    ) -> Result<Self, TransportError> {
        let port = transport.name().to_string();
        let mut read_handle = transport.try_clone()?;
        read_handle.set_read_timeout(settings.listen_timeout)?;

        let token = CancellationToken::new();
        let stats = Arc::new(ListenerStats::default());
        let writer: SharedWriter = Arc::new(Mutex::new(Some(transport)));
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();

        let reader = tokio::task::spawn_blocking({
            let token = token.clone();
            let log = log.clone();
            move || read_lines(read_handle, line_tx, token, log)
        });

        let ingest = tokio::spawn(ingest_lines(line_rx, store, stats.clone(), log.clone()));

        let requester = tokio::spawn(request_loop(
            writer.clone(),
            settings.request_interval,
            token.clone(),
            stats.clone(),
            log.clone(),
        ));

        sink_info!(log, "Polling {port} every {:?}", settings.request_interval);

        Ok(Self {
            port,
            token,
            writer,
            requester: Some(requester),
            reader: Some(reader),
            ingest: Some(ingest),
            stats,
            settings,
            log,
        })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> SessionState {
        if self.token.is_cancelled() {
            SessionState::Disconnected
        } else {
            SessionState::Connected
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolves once the session is Disconnected, for whatever reason.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Stop polling and close the port.
    ///
    /// When this returns both handles on the port are closed, so no request
    /// frame can reach it and the port can be opened again.
    pub async fn disconnect(&mut self) {
        self.token.cancel();
        let grace = self.settings.shutdown_grace;

        if let Some(handle) = self.requester.take() {
            if time::timeout(grace, handle).await.is_err() {
                sink_warn!(self.log, "Requester did not stop within {grace:?}");
            }
        }

        // Same lock every write holds, so an in-flight write finishes first.
        let writer = self.writer.clone();
        let closing = tokio::task::spawn_blocking(move || {
            let transport = lock_writer(&writer).take();
            transport
        });
        match closing.await {
            Ok(Some(transport)) => {
                drop(transport);
                sink_info!(self.log, "Connection to {} closed", self.port);
            }
            Ok(None) => {}
            Err(err) => sink_error!(self.log, "Failed to close {}: {err}", self.port),
        }

        // The reader sees the token only between reads.
        let reader_grace = grace + self.settings.listen_timeout;
        if let Some(handle) = self.reader.take() {
            if time::timeout(reader_grace, handle).await.is_err() {
                sink_warn!(self.log, "Reader for {} did not stop within {reader_grace:?}", self.port);
            }
        }

        if let Some(handle) = self.ingest.take() {
            if time::timeout(grace, handle).await.is_err() {
                sink_warn!(self.log, "Listener did not drain within {grace:?}");
            }
        }
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn request_loop(
    writer: SharedWriter,
    interval: Duration,
    token: CancellationToken,
    stats: Arc<ListenerStats>,
    log: SharedLog,
) {
    let mut ticker = time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => break,
        }

        let write = tokio::task::spawn_blocking({
            let writer = writer.clone();
            let token = token.clone();
            move || write_request(&writer, &token)
        })
        .await;

        match write {
            Ok(Ok(true)) => ListenerStats::bump(&stats.requests_sent),
            Ok(Ok(false)) => break,
            Ok(Err(err)) => {
                sink_warn!(log, "Request write failed, disconnecting: {err}");
                token.cancel();
                break;
            }
            Err(err) => {
                sink_error!(log, "Request worker failed: {err}");
                token.cancel();
                break;
            }
        }
    }

    sink_debug!(log, "Requester stopped");
}

/// `Ok(false)` when the session is already over and nothing was written.
fn write_request(writer: &SharedWriter, token: &CancellationToken) -> TransportResult<bool> {
    let mut guard = lock_writer(writer);
    if token.is_cancelled() {
        return Ok(false);
    }
    match guard.as_mut() {
        Some(transport) => {
            transport.write_all(&protocol::request_frame())?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn read_lines(
    mut transport: Box<dyn Transport>,
    lines: mpsc::UnboundedSender<String>,
    token: CancellationToken,
    log: SharedLog,
) {
    let mut assembler = LineAssembler::new();
    let mut buffer = [0u8; READ_CHUNK];

    while !token.is_cancelled() {
        match transport.read(&mut buffer) {
            Ok(0) => continue,
            Ok(read) => {
                for line in assembler.push(&buffer[..read]) {
                    if lines.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                sink_error!(log, "Read from {} failed, disconnecting: {err}", transport.name());
                token.cancel();
                break;
            }
        }
    }

    sink_debug!(log, "Reader for {} stopped", transport.name());
}

async fn ingest_lines(
    mut lines: mpsc::UnboundedReceiver<String>,
    store: ReadingStore,
    stats: Arc<ListenerStats>,
    log: SharedLog,
) {
    while let Some(line) = lines.recv().await {
        handle_line(&line, &store, &stats, &*log).await;
    }
}

/// One inbound line: ignore noise, parse frames, store readings.
pub async fn handle_line(line: &str, store: &ReadingStore, stats: &ListenerStats, log: &dyn LogSink) {
    if !protocol::is_protocol_line(line) {
        ListenerStats::bump(&stats.lines_ignored);
        sink_debug!(log, "Ignoring device output: {line}");
        return;
    }

    ListenerStats::bump(&stats.parse_attempts);
    sink_debug!(log, "Received frame: {line}");

    let reading = match protocol::parse_reading(line) {
        Ok(reading) => reading,
        Err(err) => {
            ListenerStats::bump(&stats.parse_failures);
            sink_warn!(log, "Dropping frame: {err}");
            return;
        }
    };

    match store.append(reading).await {
        Ok(id) => {
            ListenerStats::bump(&stats.readings_persisted);
            sink_info!(log, "Stored reading #{id}");
        }
        Err(err) => {
            ListenerStats::bump(&stats.store_failures);
            sink_error!(log, "Failed to store reading: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{transport::mock::MockPort, utils::logging::SilentLog};
    use pretty_assertions::assert_eq;

    const FRAME: &str = r#"{"temperature":22.5,"humidity":41.0,"pressure":1009.2,"airQuality":50,"lightLevel":300,"date":"2024-01-01","time":"10:00:00"}"#;

    #[tokio::test]
    async fn noise_lines_skip_parse_and_store() {
        let store = ReadingStore::open_in_memory(SilentLog::shared()).unwrap();
        let stats = ListenerStats::default();

        handle_line("Connecting to WiFi...", &store, &stats, &SilentLog).await;
        handle_line("  {indented}", &store, &stats, &SilentLog).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.lines_ignored, 2);
        assert_eq!(snapshot.parse_attempts, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_without_storing() {
        let store = ReadingStore::open_in_memory(SilentLog::shared()).unwrap();
        let stats = ListenerStats::default();

        handle_line("{\"temperature\":", &store, &stats, &SilentLog).await;
        handle_line(r#"{"temperature":1.0,"humidity":2.0}"#, &store, &stats, &SilentLog).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.parse_attempts, 2);
        assert_eq!(snapshot.parse_failures, 2);
        assert_eq!(snapshot.readings_persisted, 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn valid_frame_is_stored_once() {
        let store = ReadingStore::open_in_memory(SilentLog::shared()).unwrap();
        let stats = ListenerStats::default();

        handle_line(FRAME, &store, &stats, &SilentLog).await;

        assert_eq!(stats.snapshot().readings_persisted, 1);
        let rows = store.latest(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reading.temperature, 22.5);
        assert_eq!(rows[0].reading.ip_address, None);
    }

    #[tokio::test]
    async fn write_failure_ends_the_session() {
        let port = MockPort::new("ttyACM0");
        port.set_fail_writes(true);
        let store = ReadingStore::open_in_memory(SilentLog::shared()).unwrap();

        let mut session = PollingSession::start(
            Box::new(port.open()),
            store,
            SessionSettings::default(),
            SilentLog::shared(),
        )
        .unwrap();

        time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should drop to Disconnected");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.stats().requests_sent, 0);

        session.disconnect().await;
        assert_eq!(port.open_handles(), 0);
    }
}
