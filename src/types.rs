//! Core types for model-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Unique identifier for a download task
///
/// Allocated from a monotonic counter and never reused for the lifetime
/// of the queue, so stale IDs fail with `NotFound` instead of addressing
/// a different task.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<TaskId> for u64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl PartialEq<u64> for TaskId {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

impl PartialEq<TaskId> for u64 {
    fn eq(&self, other: &TaskId) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// What to download for a model source URL
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadScope {
    /// Only the version the URL points at
    #[default]
    SingleVersion,
    /// Every published version of the model
    AllVersions,
}

/// Task lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Queued and waiting to be dispatched
    Pending,
    /// Claimed by a worker, transfer in progress
    Running,
    /// Paused by user
    Paused,
    /// Successfully completed
    Completed,
    /// Failed with error (retries exhausted or error was permanent)
    Failed,
    /// Cancelled by user
    Cancelled,
}

impl TaskState {
    /// Whether this state is terminal (the task will never run again)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Options for adding a download task to the queue
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// What to download (default: the single version the URL names)
    #[serde(default)]
    pub scope: DownloadScope,

    /// Destination hint passed through to the Fetcher unchanged
    #[serde(default)]
    pub destination: Option<PathBuf>,

    /// Per-task bandwidth cap in bytes per second (None = only the
    /// global limit applies)
    #[serde(default)]
    pub bandwidth_cap_bps: Option<u64>,
}

/// Snapshot row describing one task in the queue
///
/// Values are copied out under the queue lock, so a single snapshot is
/// internally consistent (state and progress belong to the same moment).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskView {
    /// Unique task identifier
    pub id: TaskId,

    /// Normalized source URL
    pub url: Url,

    /// Download scope
    pub scope: DownloadScope,

    /// Current lifecycle state
    pub state: TaskState,

    /// Dense queue position (0-based dispatch order)
    pub position: usize,

    /// Bytes transferred so far for the current attempt
    pub bytes_downloaded: u64,

    /// Total size in bytes (None if the Fetcher has not reported it yet)
    pub total_bytes: Option<u64>,

    /// Smoothed transfer speed in bytes per second
    pub speed_bps: u64,

    /// Estimated seconds to completion (None if unknown)
    pub eta_seconds: Option<u64>,

    /// Attempt number, 1-based once the task has been dispatched
    pub attempt: u32,

    /// Most recent error message, kept until the task is removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Per-task bandwidth cap in bytes per second (None = uncapped)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_cap_bps: Option<u64>,

    /// When the task was added to the queue
    pub created_at: DateTime<Utc>,
}

impl TaskView {
    /// Progress percentage (0.0 to 100.0), or None while total is unknown
    pub fn percent(&self) -> Option<f32> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_downloaded as f64 / total as f64 * 100.0) as f32)
            }
            _ => None,
        }
    }
}

/// Queue statistics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total number of tasks in the queue
    pub total: usize,

    /// Number of pending tasks (waiting to start)
    pub pending: usize,

    /// Number of actively running tasks
    pub running: usize,

    /// Number of paused tasks
    pub paused: usize,

    /// Number of completed tasks
    pub completed: usize,

    /// Number of failed tasks
    pub failed: usize,

    /// Number of cancelled tasks
    pub cancelled: usize,

    /// Aggregate transfer speed across running tasks (bytes per second)
    pub total_speed_bps: u64,

    /// Total known size across all tasks (bytes)
    pub total_size_bytes: u64,

    /// Total downloaded bytes across all tasks
    pub downloaded_bytes: u64,

    /// Overall queue progress (0.0 to 100.0, over known sizes)
    pub overall_progress: f32,

    /// Current global bandwidth limit (None = unlimited)
    pub bandwidth_limit_bps: Option<u64>,

    /// Whether the queue is accepting new tasks
    pub accepting_new: bool,
}

/// Event emitted during the download lifecycle
///
/// Delivered over a `tokio::sync::broadcast` channel; slow subscribers
/// may observe `Lagged` and should re-sync from `snapshot()`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task added to the queue
    Queued {
        /// Task ID
        id: TaskId,
        /// Normalized source URL
        url: Url,
    },

    /// Task claimed by a worker and transfer started
    Started {
        /// Task ID
        id: TaskId,
        /// Attempt number (1-based)
        attempt: u32,
    },

    /// Coalesced progress update
    ///
    /// Byte counts are per attempt: they grow monotonically while an
    /// attempt runs and restart from zero when a retry or a resume begins
    /// a fresh attempt.
    Progress {
        /// Task ID
        id: TaskId,
        /// Bytes transferred so far
        bytes_downloaded: u64,
        /// Total size in bytes, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
        /// Smoothed speed in bytes per second
        speed_bps: u64,
        /// Estimated seconds to completion, when derivable
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        /// Progress percentage (0.0 to 100.0), when total is known
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f32>,
    },

    /// Task completed successfully
    Completed {
        /// Task ID
        id: TaskId,
        /// Total bytes transferred
        bytes_downloaded: u64,
    },

    /// Task failed (retries exhausted or error was permanent)
    Failed {
        /// Task ID
        id: TaskId,
        /// Final error message
        error: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Task cancelled
    Cancelled {
        /// Task ID
        id: TaskId,
    },

    /// Task paused
    Paused {
        /// Task ID
        id: TaskId,
    },

    /// Task resumed (re-entered the pending queue)
    Resumed {
        /// Task ID
        id: TaskId,
    },

    /// A transient failure scheduled the task for retry
    RetryScheduled {
        /// Task ID
        id: TaskId,
        /// Attempt that just failed
        attempt: u32,
        /// Delay before re-dispatch, in milliseconds
        delay_ms: u64,
        /// Error that triggered the retry
        error: String,
    },

    /// Queue order changed
    Reordered {
        /// Task that moved
        id: TaskId,
        /// Its new position
        position: usize,
    },

    /// Worker-pool target parallelism changed
    ParallelismChanged {
        /// New maximum number of concurrent downloads
        max_parallel: usize,
    },

    /// Bandwidth limit changed
    BandwidthLimitChanged {
        /// New limit in bytes per second (None = unlimited)
        limit_bps: Option<u64>,
        /// Task the limit applies to (None = global)
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<TaskId>,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
