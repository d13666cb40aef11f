//! Intent ingestion: transports that parse, validate and enqueue intents.
//!
//! Every transport runs payloads through the same [`Intake`] so parse
//! failures, firewall rejections and duplicates are handled identically no
//! matter where an intent came from.

mod file_tail;
mod http;
mod queue;

pub use file_tail::FileTailIngestor;
pub use http::HttpIngestor;
pub use queue::{IntentQueue, QueueError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::models::{IntentError, TradeIntent};
use crate::trading::{Firewall, FirewallStats, ValidationError};

/// A source of validated trade intents.
#[async_trait]
pub trait IntentIngestor: Send + Sync {
    /// Spawn the transport task. Calling `start` twice is an error.
    async fn start(&self) -> Result<()>;

    /// Stop the transport task. Already-queued intents stay retrievable.
    async fn stop(&self) -> Result<()>;

    /// Next validated intent, or `None` after `timeout`.
    async fn get_next_intent(&self, timeout: Duration) -> Option<TradeIntent>;

    fn get_stats(&self) -> IngestStats;
}

/// Counters reported by an ingestor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestStats {
    pub validated: u64,
    pub rejected: u64,
    pub parse_errors: u64,
    /// Requests refused because the queue had no free slot
    pub queue_full: u64,
    pub queue_depth: usize,
    pub firewall: FirewallStats,
}

/// Why a raw payload did not become a queued intent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Parse(#[from] IntentError),

    #[error(transparent)]
    Rejected(#[from] ValidationError),
}

impl IntakeError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Parse(e) => e.reason_code(),
            Self::Rejected(e) => e.reason_code(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Rejected(ValidationError::Duplicate { .. }))
    }
}

/// Parse + validate step shared by all transports.
#[derive(Clone)]
pub struct Intake {
    firewall: Arc<Firewall>,
    validated: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    queue_full: Arc<AtomicU64>,
}

impl Intake {
    pub fn new(firewall: Arc<Firewall>) -> Self {
        Self {
            firewall,
            validated: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            parse_errors: Arc::new(AtomicU64::new(0)),
            queue_full: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    /// Parse and validate one raw payload against the wall clock.
    pub fn admit(&self, raw: impl AsRef<[u8]>) -> Result<TradeIntent, IntakeError> {
        self.admit_at(raw, Utc::now())
    }

    pub fn admit_at(
        &self,
        raw: impl AsRef<[u8]>,
        now: DateTime<Utc>,
    ) -> Result<TradeIntent, IntakeError> {
        let intent = match TradeIntent::parse_bytes(raw.as_ref()) {
            Ok(intent) => intent,
            Err(e) => {
                self.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, field = ?e.field(), "Dropping malformed intent");
                return Err(e.into());
            }
        };

        if let Err(e) = self.firewall.validate_at(&intent, now) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        self.validated.fetch_add(1, Ordering::Relaxed);
        Ok(intent)
    }

    /// Count a payload refused for lack of queue space.
    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self, queue_depth: usize) -> IngestStats {
        IngestStats {
            validated: self.validated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            queue_depth,
            firewall: self.firewall.stats(),
        }
    }
}

/// One rejected line from a replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayRejection {
    /// 1-based line number
    pub line: usize,
    pub reason: &'static str,
    pub detail: String,
}

/// Outcome of replaying recorded payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub accepted: Vec<TradeIntent>,
    pub rejections: Vec<ReplayRejection>,
    pub stats: IngestStats,
}

/// Whitespace-only line, skipped without counting.
pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Replay recorded payloads through parse and validation against the wall clock.
pub fn replay_lines<I, L>(lines: I, firewall: Arc<Firewall>) -> ReplayReport
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    replay_lines_at(lines, firewall, Utc::now())
}

/// Replay as of a fixed instant. Same lines, same config and same instant
/// always give the same report.
pub fn replay_lines_at<I, L>(lines: I, firewall: Arc<Firewall>, now: DateTime<Utc>) -> ReplayReport
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    let intake = Intake::new(firewall);
    let mut accepted = Vec::new();
    let mut rejections = Vec::new();

    for (idx, line) in lines.into_iter().enumerate() {
        let line = line.as_ref();
        if is_blank(line) {
            continue;
        }
        match intake.admit_at(line, now) {
            Ok(intent) => accepted.push(intent),
            Err(e) => rejections.push(ReplayRejection {
                line: idx + 1,
                reason: e.reason_code(),
                detail: e.to_string(),
            }),
        }
    }

    let stats = intake.stats(0);
    ReplayReport {
        accepted,
        rejections,
        stats,
    }
}
