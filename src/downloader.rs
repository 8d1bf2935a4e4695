use std::collections::HashMap;
use std::ffi::OsString;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chunk::ChunkSet;
use crate::connection::ConnState;
use crate::error::DownloadError;
use crate::limiter::RateGate;
use crate::protocol::{strategy_for, Transfer};
use crate::source::DownloadSource;
use crate::state::{DownloadState, StateLedger};
use crate::writer::FileWriter;

/// Size of one receive buffer; also the default minimum worth stealing.
pub const RECV_BUFFER_LEN: usize = 64 * 1024;

/// Bounded event queue between receive tasks and the orchestrator; the bound
/// is what pushes rate-limit back-pressure onto fast peers.
const EVENT_QUEUE_DEPTH: usize = 64;

const PROGRESS_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of parts to split the file into on a fresh run.
    pub connections: usize,
    /// Pick up an existing ledger instead of starting over.
    pub resume: bool,
    /// Aggregate ceiling in bytes per second; `None` disables throttling.
    pub rate_limit: Option<NonZeroU32>,
    /// How long a connection may go without delivering bytes.
    pub timeout: Duration,
    /// Consecutive failures per part before the run is abandoned.
    pub retry_limit: u32,
    /// Smallest remaining range worth handing to an idle connection.
    pub min_steal: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connections: 4,
            resume: false,
            rate_limit: None,
            timeout: Duration::from_secs(10),
            retry_limit: 5,
            min_steal: RECV_BUFFER_LEN as u64,
        }
    }
}

type ProgressFn = Arc<dyn Fn(u64, f64) + Send + Sync>;

/// In-flight output path for a final output path: `<name>.part`.
pub fn part_path_for(output: &Path) -> PathBuf {
    let mut os: OsString = output.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

enum PartEvent {
    Data { index: usize, bytes: Vec<u8> },
    Finished { index: usize },
    Failed { index: usize, error: DownloadError },
}

struct PartSlot {
    /// Shrinks the part's visible `end` when a steal moves the boundary.
    end_tx: watch::Sender<u64>,
    retries: u32,
    task: JoinHandle<()>,
}

/// The download engine: one instance per run.
///
/// Each open connection is driven by its own receive task; everything that
/// must stay ordered — positional writes, cursor advancement, ledger updates,
/// retries and redistribution — happens in the single orchestrator loop that
/// consumes their events.
pub struct Engine {
    source: Arc<DownloadSource>,
    strategy: Arc<dyn Transfer>,
    file_length: u64,
    final_path: PathBuf,
    part_path: PathBuf,
    config: EngineConfig,
    progress: Option<ProgressFn>,
}

/// Handle to a started run.
pub struct DownloadHandle {
    task: JoinHandle<Result<(), DownloadError>>,
}

impl DownloadHandle {
    /// Block until completion or fatal failure.
    pub async fn join(&mut self) -> Result<(), DownloadError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Aborted),
        }
    }

    /// Stop the run. Progress recorded so far stays on disk and in the
    /// ledger, so a later run can resume.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Engine {
    pub fn new(
        source: DownloadSource,
        file_length: u64,
        output: &Path,
        config: EngineConfig,
    ) -> Self {
        let strategy = strategy_for(source.protocol);
        Self {
            source: Arc::new(source),
            strategy,
            file_length,
            final_path: output.to_path_buf(),
            part_path: part_path_for(output),
            config,
            progress: None,
        }
    }

    /// Register a callback invoked every 500 ms with
    /// `(total_received_bytes, bytes_per_second)`.
    pub fn on_progress<F>(&mut self, callback: F)
    where
        F: Fn(u64, f64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
    }

    pub fn start(self) -> DownloadHandle {
        DownloadHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(mut self) -> Result<(), DownloadError> {
        let ledger = StateLedger::for_output(&self.part_path);

        let mut chunks = if self.config.resume && ledger.available() {
            let chunks = ledger.load(self.file_length).await?;
            info!(
                received = chunks.total_received(),
                total = self.file_length,
                "resuming from ledger"
            );
            chunks
        } else {
            let chunks = ChunkSet::split(self.file_length, self.config.connections);
            ledger
                .save(&DownloadState::from_chunks(&chunks, self.file_length))
                .await?;
            chunks
        };

        let writer = Arc::new(FileWriter::prepare(&self.part_path, self.file_length).await?);
        let gate = Arc::new(RateGate::new(self.config.rate_limit));
        // Resumed bytes count toward reported totals.
        gate.add(chunks.total_received());

        let reporter = self.progress.take().map(|cb| spawn_reporter(gate.clone(), cb));

        let (tx, mut rx) = mpsc::channel::<PartEvent>(EVENT_QUEUE_DEPTH);
        let mut slots: HashMap<usize, PartSlot> = HashMap::new();
        for (index, chunk) in chunks.iter() {
            if chunk.is_complete() {
                continue;
            }
            slots.insert(
                index,
                self.spawn_part(index, chunk.current, chunk.end, &tx, &gate),
            );
        }

        let outcome = self
            .drive(&mut chunks, &ledger, &writer, &gate, &mut slots, &mut rx, &tx)
            .await;

        for slot in slots.values() {
            slot.task.abort();
        }
        if let Some(reporter) = &reporter {
            reporter.abort();
        }

        // A fatal error leaves the ledger behind for a later resume.
        outcome?;

        writer.sync().await?;
        ledger.remove().await?;
        fs::rename(&self.part_path, &self.final_path).await?;
        info!(
            file = %self.final_path.display(),
            bytes = self.file_length,
            "download complete"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        chunks: &mut ChunkSet,
        ledger: &StateLedger,
        writer: &FileWriter,
        gate: &Arc<RateGate>,
        slots: &mut HashMap<usize, PartSlot>,
        rx: &mut mpsc::Receiver<PartEvent>,
        tx: &mpsc::Sender<PartEvent>,
    ) -> Result<(), DownloadError> {
        while !chunks.is_complete() {
            let Some(event) = rx.recv().await else {
                return Err(DownloadError::Aborted);
            };

            match event {
                PartEvent::Data { index, bytes } => {
                    let Some(chunk) = chunks.get(index) else {
                        continue;
                    };
                    // Clamp against the authoritative cursor: a steal may
                    // have moved this part's boundary while bytes were in
                    // flight.
                    let take = bytes.len().min(chunk.remaining() as usize);
                    if take == 0 {
                        continue;
                    }
                    let offset = chunk.current;
                    writer.write_at(offset, &bytes[..take]).await?;
                    chunks.advance(index, take as u64);
                    gate.add(take as u64);
                    // Durable before the bytes count as resumable progress.
                    ledger
                        .save(&DownloadState::from_chunks(chunks, self.file_length))
                        .await?;
                    if let Some(slot) = slots.get_mut(&index) {
                        slot.retries = 0;
                    }
                }

                PartEvent::Finished { index } => {
                    debug!(part = index, "part finished");
                    if let Some(steal) = chunks.steal(self.config.min_steal) {
                        if let Some(victim) = slots.get(&steal.victim) {
                            let _ = victim.end_tx.send(steal.mid);
                        }
                        info!(
                            victim = steal.victim,
                            part = steal.new_index,
                            mid = steal.mid,
                            end = steal.end,
                            "redistributing remaining range to idle connection"
                        );
                        slots.insert(
                            steal.new_index,
                            self.spawn_part(steal.new_index, steal.mid, steal.end, tx, gate),
                        );
                        ledger
                            .save(&DownloadState::from_chunks(chunks, self.file_length))
                            .await?;
                    }
                }

                PartEvent::Failed { index, error } => {
                    let finished = chunks.get(index).map_or(true, |c| c.is_complete());
                    if finished {
                        debug!(part = index, %error, "failure after completion, ignored");
                        continue;
                    }
                    if !error.is_recoverable() {
                        return Err(error);
                    }
                    let Some(slot) = slots.get_mut(&index) else {
                        continue;
                    };
                    slot.retries += 1;
                    if slot.retries > self.config.retry_limit {
                        error!(part = index, %error, "retry budget exhausted");
                        return Err(DownloadError::FatalExhausted { index });
                    }
                    let current = chunks.get(index).map_or(0, |c| c.current);
                    warn!(
                        part = index,
                        retry = slot.retries,
                        at = current,
                        %error,
                        "connection lost, reopening at last confirmed offset"
                    );
                    slot.task =
                        self.spawn_task(index, current, slot.end_tx.subscribe(), tx, gate);
                }
            }
        }
        Ok(())
    }

    fn spawn_part(
        &self,
        index: usize,
        from: u64,
        end: u64,
        tx: &mpsc::Sender<PartEvent>,
        gate: &Arc<RateGate>,
    ) -> PartSlot {
        let (end_tx, end_rx) = watch::channel(end);
        PartSlot {
            end_tx,
            retries: 0,
            task: self.spawn_task(index, from, end_rx, tx, gate),
        }
    }

    fn spawn_task(
        &self,
        index: usize,
        from: u64,
        end_rx: watch::Receiver<u64>,
        tx: &mpsc::Sender<PartEvent>,
        gate: &Arc<RateGate>,
    ) -> JoinHandle<()> {
        let strategy = Arc::clone(&self.strategy);
        let source = Arc::clone(&self.source);
        let tx = tx.clone();
        let gate = Arc::clone(gate);
        let io_timeout = self.config.timeout;
        tokio::spawn(async move {
            let outcome =
                fetch_range(&*strategy, &source, index, from, &end_rx, &tx, &gate, io_timeout)
                    .await;
            let event = match outcome {
                Ok(()) => PartEvent::Finished { index },
                Err(error) => PartEvent::Failed { index, error },
            };
            let _ = tx.send(event).await;
        })
    }
}

/// One connection's attempt at its chunk: open, receive, forward.
///
/// All errors surface as a single `Failed` event; the orchestrator owns the
/// retry decision. The watched `end` shrinks when the tail of this range is
/// stolen, which simply makes this task finish earlier.
#[allow(clippy::too_many_arguments)]
async fn fetch_range(
    strategy: &dyn Transfer,
    source: &DownloadSource,
    index: usize,
    mut pos: u64,
    end_rx: &watch::Receiver<u64>,
    tx: &mpsc::Sender<PartEvent>,
    gate: &RateGate,
    io_timeout: Duration,
) -> Result<(), DownloadError> {
    let end = *end_rx.borrow();
    if pos >= end {
        return Ok(());
    }

    let mut conn = tokio::time::timeout(io_timeout, strategy.open(source, index, pos, end))
        .await
        .map_err(|_| DownloadError::Timeout)??;

    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        let end = *end_rx.borrow();
        let budget = end.saturating_sub(pos);
        if budget == 0 {
            conn.state = ConnState::Finished;
            return Ok(());
        }

        let received =
            match tokio::time::timeout(io_timeout, strategy.receive(&mut conn, &mut buf, budget))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    conn.state = ConnState::TimedOut;
                    return Err(DownloadError::Timeout);
                }
            };

        gate.throttle(received).await;
        let event = PartEvent::Data {
            index,
            bytes: buf[..received].to_vec(),
        };
        if tx.send(event).await.is_err() {
            // Orchestrator is gone; nothing left to report to.
            return Ok(());
        }
        pos += received as u64;
    }
}

fn spawn_reporter(gate: Arc<RateGate>, callback: ProgressFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = gate.total_received();
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let total = gate.total_received();
            let speed = total.saturating_sub(last) as f64 / PROGRESS_TICK.as_secs_f64();
            callback(total, speed);
            last = total;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Protocol;
    use crate::state::PartRecord;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt};
    use tokio::net::TcpListener;

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn source_for(addr: SocketAddr, protocol: Protocol) -> DownloadSource {
        let scheme = match protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ftp => "ftp",
        };
        DownloadSource {
            url: format!("{scheme}://127.0.0.1:{}/data.bin", addr.port()),
            host: "127.0.0.1".into(),
            ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
            path: "/data.bin".into(),
            file_name: "data.bin".into(),
            port: addr.port(),
            protocol,
            proxy: None,
            username: "anonymous".into(),
            password: "anonymous@zget".into(),
        }
    }

    /// How the fixture treats the first range connection it sees.
    #[derive(Clone, Copy, PartialEq)]
    enum FirstConn {
        Serve,
        /// Accept, then never send a byte.
        Stall,
        /// Send headers and half the requested body, then go silent.
        HalfThenStall,
    }

    struct HttpFixture {
        addr: SocketAddr,
        /// Range starts requested by clients, in arrival order.
        ranges: Arc<StdMutex<Vec<(u64, u64)>>>,
    }

    async fn spawn_http_fixture(
        payload: Vec<u8>,
        first_conn: FirstConn,
        misbehave_count: usize,
    ) -> HttpFixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = Arc::new(payload);
        let ranges = Arc::new(StdMutex::new(Vec::new()));
        let remaining_misbehaviors = Arc::new(AtomicUsize::new(misbehave_count));

        {
            let payload = Arc::clone(&payload);
            let ranges = Arc::clone(&ranges);
            let remaining = Arc::clone(&remaining_misbehaviors);
            tokio::spawn(async move {
                loop {
                    let Ok((mut sock, _)) = listener.accept().await else {
                        break;
                    };
                    let payload = Arc::clone(&payload);
                    let ranges = Arc::clone(&ranges);
                    let remaining = Arc::clone(&remaining);
                    tokio::spawn(async move {
                        let mut request = Vec::new();
                        let mut buf = [0u8; 1024];
                        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                            let n = sock.read(&mut buf).await.unwrap_or(0);
                            if n == 0 {
                                return;
                            }
                            request.extend_from_slice(&buf[..n]);
                        }
                        let text = String::from_utf8_lossy(&request).into_owned();
                        let range = text
                            .lines()
                            .find_map(|l| l.strip_prefix("Range: bytes="))
                            .and_then(|value| value.split_once('-'))
                            .and_then(|(a, b)| {
                                Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?))
                            });

                        let Some((from, to_inclusive)) = range else {
                            // Discovery probe.
                            let head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                                payload.len()
                            );
                            let _ = sock.write_all(head.as_bytes()).await;
                            return;
                        };

                        ranges.lock().unwrap().push((from, to_inclusive));
                        let misbehaving = first_conn != FirstConn::Serve
                            && remaining
                                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                                    v.checked_sub(1)
                                })
                                .is_ok();

                        if misbehaving && first_conn == FirstConn::Stall {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            return;
                        }

                        let to = (to_inclusive as usize + 1).min(payload.len());
                        let body = &payload[from as usize..to];
                        let head = format!(
                            "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\n\r\n",
                            body.len()
                        );
                        let _ = sock.write_all(head.as_bytes()).await;

                        if misbehaving && first_conn == FirstConn::HalfThenStall {
                            let _ = sock.write_all(&body[..body.len() / 2]).await;
                            let _ = sock.flush().await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            return;
                        }
                        let _ = sock.write_all(body).await;
                    });
                }
            });
        }

        HttpFixture { addr, ranges }
    }

    fn quick_config(connections: usize) -> EngineConfig {
        EngineConfig {
            connections,
            timeout: Duration::from_secs(5),
            min_steal: 16 * 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reassembles_exactly_across_multiple_connections() {
        let payload = test_payload(256 * 1024);
        let fixture = spawn_http_fixture(payload.clone(), FirstConn::Serve, 0).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let source = source_for(fixture.addr, Protocol::Http);

        let engine = Engine::new(source, payload.len() as u64, &output, quick_config(4));
        let mut handle = engine.start();
        handle.join().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), payload);
        assert!(!part_path_for(&output).exists());
        assert!(!StateLedger::for_output(&part_path_for(&output)).available());
        // Every part issued at least one range request.
        assert!(fixture.ranges.lock().unwrap().len() >= 4);
    }

    #[tokio::test]
    async fn resume_refetches_from_the_recorded_cursor() {
        let payload = test_payload(8192);
        let fixture = spawn_http_fixture(payload.clone(), FirstConn::Serve, 0).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let part_path = part_path_for(&output);

        // A previous run got 3000 bytes into a single-part download.
        std::fs::write(&part_path, &payload[..3000]).unwrap();
        let ledger = StateLedger::for_output(&part_path);
        ledger
            .save(&DownloadState {
                file_length: 8192,
                parts: vec![PartRecord {
                    index: 0,
                    start: 0,
                    current: 3000,
                    end: 8192,
                }],
            })
            .await
            .unwrap();

        let source = source_for(fixture.addr, Protocol::Http);
        let config = EngineConfig {
            resume: true,
            ..quick_config(1)
        };
        let engine = Engine::new(source, payload.len() as u64, &output, config);
        let mut handle = engine.start();
        handle.join().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), payload);
        let ranges = fixture.ranges.lock().unwrap();
        assert_eq!(ranges[0].0, 3000, "refetch must start at the cursor");
        assert!(ranges.iter().all(|(from, _)| *from != 0));
    }

    #[tokio::test]
    async fn corrupt_ledger_is_surfaced_not_retried() {
        let payload = test_payload(4096);
        let fixture = spawn_http_fixture(payload.clone(), FirstConn::Serve, 0).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let part_path = part_path_for(&output);
        let ledger = StateLedger::for_output(&part_path);
        // Ledger written for a different file length.
        ledger
            .save(&DownloadState {
                file_length: 999,
                parts: vec![PartRecord {
                    index: 0,
                    start: 0,
                    current: 0,
                    end: 999,
                }],
            })
            .await
            .unwrap();

        let source = source_for(fixture.addr, Protocol::Http);
        let config = EngineConfig {
            resume: true,
            ..quick_config(1)
        };
        let engine = Engine::new(source, payload.len() as u64, &output, config);
        let mut handle = engine.start();
        assert!(matches!(
            handle.join().await,
            Err(DownloadError::CorruptState(_))
        ));
    }

    #[tokio::test]
    async fn stalled_connection_retries_from_its_advanced_offset() {
        let payload = test_payload(32 * 1024);
        let fixture =
            spawn_http_fixture(payload.clone(), FirstConn::HalfThenStall, 1).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let source = source_for(fixture.addr, Protocol::Http);
        let config = EngineConfig {
            timeout: Duration::from_millis(300),
            min_steal: u64::MAX, // keep the range map simple
            ..quick_config(1)
        };
        let engine = Engine::new(source, payload.len() as u64, &output, config);
        let mut handle = engine.start();
        handle.join().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), payload);
        let ranges = fixture.ranges.lock().unwrap();
        assert!(ranges.len() >= 2, "expected a retry, got {ranges:?}");
        assert_eq!(ranges[0].0, 0);
        // The retry resumes from the bytes already written, not from zero.
        assert!(
            ranges[1].0 > 0 && ranges[1].0 < payload.len() as u64,
            "retry started at {}",
            ranges[1].0
        );
    }

    #[tokio::test]
    async fn permanently_stalled_peer_exhausts_the_retry_budget() {
        let payload = test_payload(16 * 1024);
        let fixture = spawn_http_fixture(payload.clone(), FirstConn::Stall, 100).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let source = source_for(fixture.addr, Protocol::Http);
        let config = EngineConfig {
            timeout: Duration::from_millis(200),
            retry_limit: 1,
            min_steal: u64::MAX,
            ..quick_config(1)
        };
        let engine = Engine::new(source, payload.len() as u64, &output, config);
        let mut handle = engine.start();
        assert!(matches!(
            handle.join().await,
            Err(DownloadError::FatalExhausted { index: 0 })
        ));

        // Fatal failure keeps the ledger for a future resume.
        assert!(StateLedger::for_output(&part_path_for(&output)).available());
    }

    #[tokio::test]
    async fn zero_length_file_completes_immediately() {
        let fixture = spawn_http_fixture(Vec::new(), FirstConn::Serve, 0).await;

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("empty.bin");
        let source = source_for(fixture.addr, Protocol::Http);
        let engine = Engine::new(source, 0, &output, quick_config(3));
        let mut handle = engine.start();
        handle.join().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"");
        assert!(!StateLedger::for_output(&part_path_for(&output)).available());
    }

    async fn spawn_ftp_fixture(payload: Vec<u8>) -> (SocketAddr, Arc<StdMutex<Vec<u64>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = Arc::new(payload);
        let rest_offsets = Arc::new(StdMutex::new(Vec::new()));

        {
            let payload = Arc::clone(&payload);
            let rest_offsets = Arc::clone(&rest_offsets);
            tokio::spawn(async move {
                loop {
                    let Ok((sock, _)) = listener.accept().await else {
                        break;
                    };
                    let payload = Arc::clone(&payload);
                    let rest_offsets = Arc::clone(&rest_offsets);
                    tokio::spawn(async move {
                        let (reader, mut writer) = sock.into_split();
                        let mut lines = BufReader::new(reader).lines();
                        writer.write_all(b"220 zget test ftpd\r\n").await.unwrap();

                        let mut offset = 0u64;
                        let mut data_listener: Option<TcpListener> = None;
                        while let Ok(Some(line)) = lines.next_line().await {
                            let cmd = line.trim();
                            let reply: String = if cmd.starts_with("USER") {
                                "331 password please\r\n".into()
                            } else if cmd.starts_with("PASS") {
                                "230 logged in\r\n".into()
                            } else if cmd.starts_with("TYPE") {
                                "200 binary\r\n".into()
                            } else if cmd.starts_with("CWD") {
                                "250 ok\r\n".into()
                            } else if cmd.starts_with("SIZE") {
                                format!("213 {}\r\n", payload.len())
                            } else if cmd.starts_with("REST") {
                                offset = cmd[5..].trim().parse().unwrap();
                                rest_offsets.lock().unwrap().push(offset);
                                "350 restarting\r\n".into()
                            } else if cmd.starts_with("PASV") {
                                let dl = TcpListener::bind("127.0.0.1:0").await.unwrap();
                                let port = dl.local_addr().unwrap().port();
                                data_listener = Some(dl);
                                format!("227 Entering Passive Mode (127,0,0,1,{},{})\r\n", port >> 8, port & 0xff)
                            } else if cmd.starts_with("RETR") {
                                if offset == 0 {
                                    rest_offsets.lock().unwrap().push(0);
                                }
                                writer.write_all(b"150 sending\r\n").await.unwrap();
                                let (mut data, _) =
                                    data_listener.take().unwrap().accept().await.unwrap();
                                // The client may stop reading once its range
                                // budget is spent.
                                let _ = data.write_all(&payload[offset as usize..]).await;
                                drop(data);
                                "226 done\r\n".into()
                            } else if cmd.starts_with("QUIT") {
                                break;
                            } else {
                                "502 not implemented\r\n".into()
                            };
                            if writer.write_all(reply.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });
        }

        (addr, rest_offsets)
    }

    #[tokio::test]
    async fn ftp_download_over_two_parts() {
        let payload = test_payload(8192);
        let (addr, rest_offsets) = spawn_ftp_fixture(payload.clone()).await;

        // Discovery goes through SIZE.
        let source = source_for(addr, Protocol::Ftp);
        let strategy = strategy_for(Protocol::Ftp);
        assert_eq!(
            strategy.discover(&source).await.unwrap(),
            crate::protocol::Probe::Size(8192)
        );

        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("data.bin");
        let config = EngineConfig {
            min_steal: u64::MAX,
            ..quick_config(2)
        };
        let engine = Engine::new(source, payload.len() as u64, &output, config);
        let mut handle = engine.start();
        handle.join().await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), payload);
        // One transfer restarted at zero, one at the second chunk boundary.
        let offsets = rest_offsets.lock().unwrap();
        assert!(offsets.contains(&0));
        assert!(offsets.contains(&4096));
    }
}
