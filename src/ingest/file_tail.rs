//! JSON-lines file tail.
//!
//! Polls the file from a tracked byte offset and only consumes complete,
//! newline-terminated lines; a trailing partial line is left for the next
//! poll. A file that shrinks is assumed rotated and re-read from the start.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::TradeIntent;
use crate::trading::{Firewall, IngestConfig};

use super::{is_blank, IngestStats, Intake, IntentIngestor, IntentQueue};

struct Running {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Ingestor reading intents appended to a JSONL file.
pub struct FileTailIngestor {
    path: PathBuf,
    config: IngestConfig,
    intake: Intake,
    queue: IntentQueue,
    offset: Arc<AtomicU64>,
    running: Mutex<Option<Running>>,
}

impl FileTailIngestor {
    pub fn new(path: impl Into<PathBuf>, firewall: Arc<Firewall>, config: IngestConfig) -> Self {
        let queue = IntentQueue::new(config.queue_capacity);
        Self {
            path: path.into(),
            config,
            intake: Intake::new(firewall),
            queue,
            offset: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset up to which the file has been consumed.
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentIngestor for FileTailIngestor {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        anyhow::ensure!(running.is_none(), "file tail ingestor already running");

        if self.config.start_at_end {
            if let Ok(meta) = tokio::fs::metadata(&self.path).await {
                self.offset.store(meta.len(), Ordering::SeqCst);
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tail = Tail {
            path: self.path.clone(),
            intake: self.intake.clone(),
            queue: self.queue.clone(),
            offset: self.offset.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
        };
        let handle = tokio::spawn(tail.run(shutdown_rx));

        info!(
            path = %self.path.display(),
            offset = self.offset(),
            "File tail ingestor started"
        );
        *running = Some(Running { handle, shutdown });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(Running { mut handle, shutdown }) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = shutdown.send(true);
        let limit = Duration::from_millis(self.config.shutdown_timeout_ms);
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined.context("File tail task panicked")?,
            Err(_) => {
                warn!(timeout_ms = self.config.shutdown_timeout_ms, "File tail did not stop in time, aborting");
                handle.abort();
            }
        }

        info!(path = %self.path.display(), queued = self.queue.depth(), "File tail ingestor stopped");
        Ok(())
    }

    async fn get_next_intent(&self, timeout: Duration) -> Option<TradeIntent> {
        self.queue.pop(timeout).await
    }

    fn get_stats(&self) -> IngestStats {
        self.intake.stats(self.queue.depth())
    }
}

/// State owned by the polling task.
struct Tail {
    path: PathBuf,
    intake: Intake,
    queue: IntentQueue,
    offset: Arc<AtomicU64>,
    poll_interval: Duration,
}

/// Result of one poll.
enum TailPoll {
    Missing,
    Read,
    Shutdown,
}

impl Tail {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut waiting_logged = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(&mut shutdown).await {
                Ok(TailPoll::Read) => waiting_logged = false,
                Ok(TailPoll::Missing) => {
                    if !waiting_logged {
                        debug!(path = %self.path.display(), "Waiting for intent file to appear");
                        waiting_logged = true;
                    }
                }
                Ok(TailPoll::Shutdown) => break,
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to read intent file"),
            }
        }
    }

    /// Consume complete lines past the offset.
    ///
    /// A queue slot is reserved before a line is validated, and the offset
    /// moves past a line only once it has been handled, so a shutdown while
    /// waiting for capacity leaves that line to be read again.
    async fn poll_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<TailPoll> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TailPoll::Missing),
            Err(e) => return Err(e.into()),
        };

        let mut offset = self.offset.load(Ordering::SeqCst);
        if len < offset {
            info!(path = %self.path.display(), old_offset = offset, len, "Intent file shrank, rereading from start");
            offset = 0;
            self.offset.store(0, Ordering::SeqCst);
        }
        if len == offset {
            return Ok(TailPoll::Read);
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf).await?;

        let mut line_start = 0;
        while let Some(newline) = buf[line_start..].iter().position(|b| *b == b'\n') {
            let line = &buf[line_start..line_start + newline];
            line_start += newline + 1;

            if !is_blank(line) {
                // Waits for capacity so intents stay in file order.
                let permit = tokio::select! {
                    _ = shutdown.changed() => return Ok(TailPoll::Shutdown),
                    permit = self.queue.reserve() => permit,
                };
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        warn!(error = %e, "Intent queue unavailable, pausing tail");
                        return Ok(TailPoll::Read);
                    }
                };
                if let Ok(intent) = self.intake.admit(line) {
                    permit.send(intent);
                }
            }

            self.offset.store(offset + line_start as u64, Ordering::SeqCst);
        }

        Ok(TailPoll::Read)
    }
}
