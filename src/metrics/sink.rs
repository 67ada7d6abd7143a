use super::CallAttemptRecord;
use crate::error::Error;
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

/// Destination for attempt records beyond the in-memory ring buffers.
///
/// `report` runs on the request path and must not wait on I/O. The
/// executor logs and swallows sink errors.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn report(&self, record: &CallAttemptRecord) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub struct NoopAttemptSink;

#[async_trait]
impl AttemptSink for NoopAttemptSink {
    async fn report(&self, _record: &CallAttemptRecord) -> Result<()> {
        Ok(())
    }
}

/// Collects records in memory. Useful in tests.
pub struct InMemoryAttemptSink {
    records: Arc<RwLock<Vec<CallAttemptRecord>>>,
    max_records: usize,
}

impl InMemoryAttemptSink {
    pub fn new(max: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            max_records: max,
        }
    }

    pub fn records(&self) -> Vec<CallAttemptRecord> {
        self.records
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AttemptSink for InMemoryAttemptSink {
    async fn report(&self, record: &CallAttemptRecord) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.push(record.clone());
        if records.len() > self.max_records {
            records.remove(0);
        }
        Ok(())
    }
}

const DEFAULT_QUEUE: usize = 1024;
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(10);

enum Command {
    Line(Vec<u8>),
    Flush(oneshot::Sender<std::io::Result<()>>),
}

fn writer_stopped() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "attempt log writer stopped",
    ))
}

/// Appends one JSON object per line.
///
/// `report` only enqueues: a background task owns the file and does the
/// I/O. When the queue is full the record is dropped and counted. Must be
/// created inside a Tokio runtime.
pub struct JsonlAttemptSink {
    path: Option<PathBuf>,
    tx: mpsc::Sender<Command>,
    dropped: AtomicU64,
    last_drop_warn: Mutex<Option<Instant>>,
}

impl JsonlAttemptSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_queue(path, DEFAULT_QUEUE)
    }

    pub fn with_queue(path: impl AsRef<Path>, queue: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel(queue.max(1));
        let target = path.clone();
        tokio::spawn(async move {
            match open_append(&target).await {
                Ok(file) => write_loop(file, rx).await,
                Err(e) => {
                    warn!(path = %target.display(), error = %e, "cannot open attempt log; records discarded");
                    discard_loop(rx, e.kind()).await
                }
            }
        });
        Self::from_parts(Some(path), tx)
    }

    /// Write lines to an arbitrary writer instead of a file.
    pub fn from_writer<W>(writer: W, queue: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue.max(1));
        tokio::spawn(write_loop(writer, rx));
        Self::from_parts(None, tx)
    }

    fn from_parts(path: Option<PathBuf>, tx: mpsc::Sender<Command>) -> Self {
        Self {
            path,
            tx,
            dropped: AtomicU64::new(0),
            last_drop_warn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records discarded because the writer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_warn_drop(&self) -> bool {
        let mut last = self.last_drop_warn.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < DROP_WARN_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl AttemptSink for JsonlAttemptSink {
    async fn report(&self, record: &CallAttemptRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        match self.tx.try_send(Command::Line(line)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.should_warn_drop() {
                    warn!(dropped_total = total, "attempt log queue full; dropping records");
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(writer_stopped()),
        }
    }

    /// Resolves once every line queued before the call is written and the
    /// file flushed.
    async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| writer_stopped())?;
        done.await.map_err(|_| writer_stopped())??;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Line(line) => {
                if let Err(e) = writer.write_all(&line).await {
                    warn!(error = %e, "attempt log write failed");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(writer.flush().await);
            }
        }
    }
    let _ = writer.flush().await;
}

async fn discard_loop(mut rx: mpsc::Receiver<Command>, kind: std::io::ErrorKind) {
    while let Some(cmd) = rx.recv().await {
        if let Command::Flush(ack) = cmd {
            let _ = ack.send(Err(std::io::Error::new(kind, "attempt log unavailable")));
        }
    }
}
