//! External collaborator traits and the per-transfer execution context
//!
//! The engine does not transfer bytes itself. A consumer supplies a
//! [`Fetcher`] that talks to the remote model-hosting API; the engine hands
//! it a [`FetchContext`] through which the transfer cooperates with rate
//! limiting, progress reporting, and pause/cancel signals. The context must
//! be consulted at every chunk boundary:
//!
//! ```text
//! loop per chunk:
//!     match ctx.checkpoint() {
//!         ChunkSignal::Continue => {}
//!         ChunkSignal::Pause => return FetchOutcome::Paused,
//!         ChunkSignal::Cancel => return FetchOutcome::Cancelled,
//!     }
//!     ctx.throttle(chunk_len).await;
//!     // ... transfer the chunk ...
//!     ctx.report(chunk_len, total_size);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::rate_limiter::RateLimiter;
use crate::types::{DownloadScope, TaskId, TaskState};

/// What the engine asks a Fetcher to transfer
#[derive(Clone, Debug)]
pub struct FetchRequest {
    /// Task being executed
    pub id: TaskId,

    /// Normalized source URL
    pub url: Url,

    /// Download scope
    pub scope: DownloadScope,

    /// Destination hint, passed through unchanged
    pub destination: Option<PathBuf>,

    /// Attempt number (1-based); a Fetcher with range support may use this
    /// to decide whether to resume from a partial file
    pub attempt: u32,
}

/// Terminal result of one fetch attempt
///
/// The engine classifies follow-up behavior from the variant: `Transient`
/// goes through the retry policy, `Permanent` fails the task immediately,
/// `Paused`/`Cancelled` acknowledge a cooperative signal observed via
/// [`FetchContext::checkpoint`].
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    /// Transfer finished
    Success {
        /// Total bytes transferred
        bytes: u64,
        /// Opaque metadata forwarded to the history sink (model name,
        /// file hashes, whatever the Fetcher learned)
        metadata: Option<serde_json::Value>,
    },
    /// Recoverable failure (timeout, connection reset, 5xx)
    Transient(String),
    /// Unrecoverable failure (404, auth failure, disk full)
    Permanent(String),
    /// The fetch observed a pause signal and stopped at a chunk boundary
    Paused,
    /// The fetch observed a cancel signal and stopped at a chunk boundary
    Cancelled,
}

/// Signal returned from [`FetchContext::checkpoint`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSignal {
    /// Keep transferring
    Continue,
    /// Stop and return [`FetchOutcome::Paused`]
    Pause,
    /// Stop and return [`FetchOutcome::Cancelled`]
    Cancel,
}

/// Shared progress counters for one task
///
/// Written by the executing Fetcher through [`FetchContext::report`], read
/// by the progress reporter and queue snapshots without taking the queue
/// lock during transfer.
#[derive(Debug, Default)]
pub struct TaskProgress {
    /// Bytes transferred so far in the current attempt
    pub(crate) bytes: AtomicU64,
    /// Total size in bytes (0 = not yet known)
    pub(crate) total: AtomicU64,
}

impl TaskProgress {
    /// Bytes transferred so far
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Total size, if the Fetcher has reported one
    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        }
    }

    /// Reset the byte counter for a fresh attempt
    pub(crate) fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Cooperative control flags shared between the queue and the worker
/// executing a task
#[derive(Clone, Debug, Default)]
pub struct TaskControl {
    pub(crate) cancel: CancellationToken,
    pub(crate) paused: Arc<AtomicBool>,
}

impl TaskControl {
    pub(crate) fn request_pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_pause(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.cancel();
    }
}

/// Execution context handed to [`Fetcher::fetch`]
///
/// Cancellation and pause are observed only when the Fetcher calls
/// [`checkpoint`](Self::checkpoint), so their latency is one chunk interval.
pub struct FetchContext {
    id: TaskId,
    limiter: RateLimiter,
    progress: Arc<TaskProgress>,
    control: TaskControl,
}

impl FetchContext {
    pub(crate) fn new(
        id: TaskId,
        limiter: RateLimiter,
        progress: Arc<TaskProgress>,
        control: TaskControl,
    ) -> Self {
        Self {
            id,
            limiter,
            progress,
            control,
        }
    }

    /// Task this context belongs to
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Acquire bandwidth for the next chunk, suspending until the global
    /// and per-task ceilings allow it
    pub async fn throttle(&self, bytes: u64) {
        self.limiter.acquire(self.id, bytes).await;
    }

    /// Record transferred bytes and optionally the total size
    ///
    /// Deltas accumulate; the byte counter never moves backwards within
    /// an attempt.
    pub fn report(&self, delta: u64, total: Option<u64>) {
        self.progress.bytes.fetch_add(delta, Ordering::Relaxed);
        if let Some(total) = total {
            self.progress.total.store(total, Ordering::Relaxed);
        }
    }

    /// Check for pending control signals; must be called at every chunk
    /// boundary. Cancel wins over pause when both are set.
    pub fn checkpoint(&self) -> ChunkSignal {
        if self.control.cancel.is_cancelled() {
            ChunkSignal::Cancel
        } else if self.control.paused.load(Ordering::Relaxed) {
            ChunkSignal::Pause
        } else {
            ChunkSignal::Continue
        }
    }
}

/// Transfers bytes for one fetch request
///
/// Implementations own all remote-API specifics (endpoints, auth, range
/// resume). The engine guarantees at most one in-flight fetch per task.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Execute one transfer attempt
    ///
    /// Must not panic for ordinary failures; classify them as `Transient`
    /// or `Permanent` instead. A panic is caught at the worker boundary and
    /// fails the task.
    async fn fetch(&self, request: FetchRequest, ctx: &FetchContext) -> FetchOutcome;
}

/// Validates and normalizes raw URL strings before a task is created
pub trait UrlValidator: Send + Sync {
    /// Parse and validate a raw URL, returning the normalized form
    fn validate(&self, raw: &str) -> Result<Url>;
}

/// Default validator: requires an absolute http(s) URL with a host
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpUrlValidator;

impl UrlValidator for HttpUrlValidator {
    fn validate(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid URL '{raw}': {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported scheme '{other}' (expected http or https)"
                )));
            }
        }

        if url.host_str().is_none() {
            return Err(Error::InvalidInput(format!("URL '{raw}' has no host")));
        }

        Ok(url)
    }
}

/// Record describing a finished task, handed to the history sink
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct HistoryRecord {
    /// Task identifier
    pub id: TaskId,

    /// Source URL
    pub url: Url,

    /// Final state (Completed, Failed, or Cancelled)
    pub final_state: TaskState,

    /// Bytes transferred before the task finished
    pub bytes_downloaded: u64,

    /// Final error message for failed tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Metadata the Fetcher attached to a successful transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// When the task reached its terminal state
    pub completed_at: DateTime<Utc>,
}

/// Persists records of finished tasks
///
/// Called fire-and-forget from a spawned task on every terminal
/// transition; the engine never waits on it.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Record one finished task
    async fn record(&self, entry: HistoryRecord);
}

/// History sink that discards all records (the default)
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpHistorySink;

#[async_trait]
impl HistorySink for NoOpHistorySink {
    async fn record(&self, _entry: HistoryRecord) {}
}
