//! Task queue: owns every download task and serializes state transitions
//!
//! All task state lives in one `Vec` behind a `tokio::sync::Mutex`; the
//! index of a task is its queue position, so positions are a dense
//! `0..N-1` permutation by construction. Workers never hold the lock while
//! transferring bytes — they claim a task, drop the lock, and report back
//! through accessors when the attempt finishes.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{Error, Result};
use crate::fetcher::{HistoryRecord, TaskControl, TaskProgress};
use crate::types::{DownloadScope, QueueStats, TaskId, TaskOptions, TaskState, TaskView};

/// One task as stored in the queue
struct TaskEntry {
    id: TaskId,
    url: Url,
    scope: DownloadScope,
    destination: Option<PathBuf>,
    state: TaskState,
    /// Attempt counter, 0 until first claimed, then 1-based
    attempt: u32,
    last_error: Option<String>,
    bandwidth_cap_bps: Option<u64>,
    /// Earliest instant a retrying task may be dispatched again
    not_before: Option<Instant>,
    created_at: DateTime<Utc>,
    progress: Arc<TaskProgress>,
    control: TaskControl,
    /// Smoothed speed, written back by the progress reporter
    speed_bps: u64,
    eta_seconds: Option<u64>,
}

impl TaskEntry {
    fn view(&self, position: usize) -> TaskView {
        TaskView {
            id: self.id,
            url: self.url.clone(),
            scope: self.scope,
            state: self.state,
            position,
            bytes_downloaded: self.progress.bytes(),
            total_bytes: self.progress.total(),
            speed_bps: self.speed_bps,
            eta_seconds: self.eta_seconds,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            bandwidth_cap_bps: self.bandwidth_cap_bps,
            created_at: self.created_at,
        }
    }
}

/// Everything a worker needs to execute one claimed attempt
///
/// Holds clones of the shared progress counters and control flags so the
/// worker and Fetcher operate without touching the queue lock.
pub(crate) struct Claim {
    pub(crate) id: TaskId,
    pub(crate) url: Url,
    pub(crate) scope: DownloadScope,
    pub(crate) destination: Option<PathBuf>,
    pub(crate) attempt: u32,
    pub(crate) progress: Arc<TaskProgress>,
    pub(crate) control: TaskControl,
}

/// Result of a pause request, so the caller knows what to emit
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PauseOutcome {
    /// Task was running; flag set, the worker will park it at the next
    /// chunk boundary
    SignalledRunning,
    /// Task was pending and is now paused
    PausedNow,
    /// Already paused or terminal; nothing to do
    NoOp,
}

/// Result of a cancel request
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// Task was running; token cancelled, the worker will finalize it
    SignalledRunning,
    /// Task was pending or paused and is now cancelled
    CancelledNow,
    /// Already terminal; nothing to do
    NoOp,
}

/// The download task queue
pub(crate) struct TaskQueue {
    tasks: Mutex<Vec<TaskEntry>>,
    next_id: AtomicU64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a new pending task at the end of the queue
    ///
    /// The URL must already be validated; the queue does not re-check it.
    pub(crate) async fn enqueue(&self, url: Url, options: TaskOptions) -> TaskId {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));

        let entry = TaskEntry {
            id,
            url,
            scope: options.scope,
            destination: options.destination,
            state: TaskState::Pending,
            attempt: 0,
            last_error: None,
            bandwidth_cap_bps: options.bandwidth_cap_bps,
            not_before: None,
            created_at: Utc::now(),
            progress: Arc::new(TaskProgress::default()),
            control: TaskControl::default(),
            speed_bps: 0,
            eta_seconds: None,
        };

        self.tasks.lock().await.push(entry);
        id
    }

    /// Atomically claim the next dispatchable task
    ///
    /// Scans in position order for the first `Pending` task whose backoff
    /// deadline (if any) has elapsed, transitions it to `Running` under the
    /// lock, and bumps its attempt counter. Returns `None` when nothing is
    /// dispatchable right now.
    pub(crate) async fn claim_next(&self) -> Option<Claim> {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().await;

        let entry = tasks.iter_mut().find(|t| {
            t.state == TaskState::Pending && t.not_before.is_none_or(|nb| nb <= now)
        })?;

        entry.state = TaskState::Running;
        entry.attempt += 1;
        entry.not_before = None;
        entry.control.clear_pause();
        // Transfers restart from the beginning on each attempt
        entry.progress.reset();
        entry.speed_bps = 0;
        entry.eta_seconds = None;

        Some(Claim {
            id: entry.id,
            url: entry.url.clone(),
            scope: entry.scope,
            destination: entry.destination.clone(),
            attempt: entry.attempt,
            progress: Arc::clone(&entry.progress),
            control: entry.control.clone(),
        })
    }

    pub(crate) async fn mark_completed(&self, id: TaskId) {
        self.finalize(id, TaskState::Completed, None).await;
    }

    pub(crate) async fn mark_failed(&self, id: TaskId, error: String) {
        self.finalize(id, TaskState::Failed, Some(error)).await;
    }

    pub(crate) async fn mark_cancelled(&self, id: TaskId) {
        self.finalize(id, TaskState::Cancelled, None).await;
    }

    pub(crate) async fn mark_paused(&self, id: TaskId) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.iter_mut().find(|t| t.id == id) {
            entry.state = TaskState::Paused;
            entry.speed_bps = 0;
            entry.eta_seconds = None;
        }
    }

    async fn finalize(&self, id: TaskId, state: TaskState, error: Option<String>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.iter_mut().find(|t| t.id == id) {
            entry.state = state;
            if error.is_some() {
                entry.last_error = error;
            }
            entry.speed_bps = 0;
            entry.eta_seconds = None;
        }
    }

    /// Put a transiently-failed task back into `Pending` with a backoff
    /// deadline, keeping the error visible until the next attempt succeeds
    pub(crate) async fn schedule_retry(&self, id: TaskId, not_before: Instant, error: String) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.iter_mut().find(|t| t.id == id) {
            entry.state = TaskState::Pending;
            entry.not_before = Some(not_before);
            entry.last_error = Some(error);
            entry.speed_bps = 0;
            entry.eta_seconds = None;
        }
    }

    /// Request a pause; semantics depend on the current state
    pub(crate) async fn pause(&self, id: TaskId) -> Result<PauseOutcome> {
        let mut tasks = self.tasks.lock().await;
        let entry = find_mut(&mut tasks, id)?;

        match entry.state {
            TaskState::Running => {
                entry.control.request_pause();
                Ok(PauseOutcome::SignalledRunning)
            }
            TaskState::Pending => {
                entry.state = TaskState::Paused;
                entry.not_before = None;
                Ok(PauseOutcome::PausedNow)
            }
            // Pausing a paused or finished task is an idempotent no-op
            _ => Ok(PauseOutcome::NoOp),
        }
    }

    /// Resume a paused task back into dispatch order
    ///
    /// Returns true if the task actually transitioned. Also clears a pause
    /// flag that was requested but not yet observed by the worker.
    pub(crate) async fn resume(&self, id: TaskId) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let entry = find_mut(&mut tasks, id)?;

        match entry.state {
            TaskState::Paused => {
                entry.state = TaskState::Pending;
                entry.control.clear_pause();
                Ok(true)
            }
            TaskState::Running => {
                // Pause requested but not yet observed: withdraw it
                entry.control.clear_pause();
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Request a cancel; immediate for inactive tasks, cooperative for
    /// running ones
    pub(crate) async fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        let mut tasks = self.tasks.lock().await;
        let entry = find_mut(&mut tasks, id)?;

        match entry.state {
            TaskState::Running => {
                entry.control.request_cancel();
                Ok(CancelOutcome::SignalledRunning)
            }
            TaskState::Pending | TaskState::Paused => {
                entry.state = TaskState::Cancelled;
                entry.not_before = None;
                entry.speed_bps = 0;
                entry.eta_seconds = None;
                Ok(CancelOutcome::CancelledNow)
            }
            // Cancelling a finished task is a no-op
            _ => Ok(CancelOutcome::NoOp),
        }
    }

    /// Move a task to a new position, shifting the tasks in between
    ///
    /// Positions stay dense. Reordering a running task only affects where
    /// it sits in future snapshots; the transfer is unaffected.
    pub(crate) async fn reorder(&self, id: TaskId, new_pos: usize) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        let len = tasks.len();
        if new_pos >= len {
            return Err(Error::InvalidPosition {
                position: new_pos,
                len,
            });
        }

        let current = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or(Error::NotFound { id: id.get() })?;

        let entry = tasks.remove(current);
        tasks.insert(new_pos, entry);
        Ok(())
    }

    /// Drop all terminal tasks, renormalizing positions
    ///
    /// Returns the removed tasks' IDs so callers can release per-task
    /// limiter state.
    pub(crate) async fn remove_finished(&self) -> Vec<TaskId> {
        let mut tasks = self.tasks.lock().await;
        let mut removed = Vec::new();
        tasks.retain(|t| {
            if t.state.is_terminal() {
                removed.push(t.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Consistent snapshot of every task, in position order
    pub(crate) async fn snapshot(&self) -> Vec<TaskView> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .enumerate()
            .map(|(pos, t)| t.view(pos))
            .collect()
    }

    /// Snapshot of a single task
    pub(crate) async fn get(&self, id: TaskId) -> Result<TaskView> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .position(|t| t.id == id)
            .map(|pos| tasks[pos].view(pos))
            .ok_or(Error::NotFound { id: id.get() })
    }

    /// IDs of tasks currently in the given state
    pub(crate) async fn ids_in_state(&self, state: TaskState) -> Vec<TaskId> {
        let tasks = self.tasks.lock().await;
        tasks
            .iter()
            .filter(|t| t.state == state)
            .map(|t| t.id)
            .collect()
    }

    /// Aggregate statistics across the queue
    pub(crate) async fn stats(
        &self,
        bandwidth_limit_bps: Option<u64>,
        accepting_new: bool,
    ) -> QueueStats {
        let tasks = self.tasks.lock().await;

        let mut stats = QueueStats {
            total: tasks.len(),
            pending: 0,
            running: 0,
            paused: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            total_speed_bps: 0,
            total_size_bytes: 0,
            downloaded_bytes: 0,
            overall_progress: 0.0,
            bandwidth_limit_bps,
            accepting_new,
        };

        for t in tasks.iter() {
            match t.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Paused => stats.paused += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
            stats.total_speed_bps += t.speed_bps;
            stats.downloaded_bytes += t.progress.bytes();
            if let Some(total) = t.progress.total() {
                stats.total_size_bytes += total;
            }
        }

        if stats.total_size_bytes > 0 {
            stats.overall_progress =
                (stats.downloaded_bytes as f64 / stats.total_size_bytes as f64 * 100.0) as f32;
        }

        stats
    }

    /// Write the reporter's smoothed speed and ETA back onto a task
    pub(crate) async fn set_rate(&self, id: TaskId, speed_bps: u64, eta_seconds: Option<u64>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(entry) = tasks.iter_mut().find(|t| t.id == id && t.state == TaskState::Running)
        {
            entry.speed_bps = speed_bps;
            entry.eta_seconds = eta_seconds;
        }
    }

    /// Build the history record for a task that just reached a terminal state
    pub(crate) async fn history_record(&self, id: TaskId) -> Option<HistoryRecord> {
        let tasks = self.tasks.lock().await;
        let entry = tasks.iter().find(|t| t.id == id)?;
        if !entry.state.is_terminal() {
            return None;
        }
        Some(HistoryRecord {
            id: entry.id,
            url: entry.url.clone(),
            final_state: entry.state,
            bytes_downloaded: entry.progress.bytes(),
            error: entry.last_error.clone(),
            metadata: None,
            completed_at: Utc::now(),
        })
    }
}

fn find_mut(tasks: &mut [TaskEntry], id: TaskId) -> Result<&mut TaskEntry> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or(Error::NotFound { id: id.get() })
}
