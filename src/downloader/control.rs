//! Task lifecycle control - pause, resume, cancel, reorder, runtime tuning.

use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::queue::{CancelOutcome, PauseOutcome};
use crate::types::{Event, TaskId, TaskState};

use super::ModelDownloader;

impl ModelDownloader {
    /// Pause a task
    ///
    /// A running task keeps its `Running` state until the worker observes
    /// the signal at the next chunk boundary, so pause latency is at most
    /// one chunk interval. A pending task is parked immediately. Pausing a
    /// task that is already paused or finished is an idempotent no-op.
    pub async fn pause(&self, id: TaskId) -> Result<()> {
        match self.queue.pause(id).await? {
            PauseOutcome::SignalledRunning => {
                tracing::debug!(task_id = id.get(), "Pause requested for running task");
            }
            PauseOutcome::PausedNow => {
                tracing::info!(task_id = id.get(), "Task paused");
                self.emit_event(Event::Paused { id });
            }
            PauseOutcome::NoOp => {}
        }
        Ok(())
    }

    /// Resume a paused task
    ///
    /// The task re-enters the pending queue at its current position and is
    /// dispatched when a worker slot frees up. Transfers restart from the
    /// beginning unless the Fetcher resumes ranges on its own. Resuming a
    /// task that is not paused is a no-op (it also withdraws a pause
    /// request the worker has not observed yet).
    pub async fn resume(&self, id: TaskId) -> Result<()> {
        if self.queue.resume(id).await? {
            tracing::info!(task_id = id.get(), "Task resumed");
            self.emit_event(Event::Resumed { id });
            self.pool.notify.notify_waiters();
        }
        Ok(())
    }

    /// Cancel a task
    ///
    /// Pending and paused tasks are cancelled immediately; running tasks
    /// are signalled and finalized by their worker at the next chunk
    /// boundary. Cancelling a finished task is a no-op.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        match self.queue.cancel(id).await? {
            CancelOutcome::SignalledRunning => {
                tracing::debug!(task_id = id.get(), "Cancel requested for running task");
            }
            CancelOutcome::CancelledNow => {
                tracing::info!(task_id = id.get(), "Task cancelled");
                self.limiter.forget_task(id);
                self.emit_event(Event::Cancelled { id });
                self.record_history(id, None).await;
            }
            CancelOutcome::NoOp => {}
        }
        Ok(())
    }

    /// Pause every pending and running task
    pub async fn pause_all(&self) -> Result<()> {
        for view in self.queue.snapshot().await {
            if matches!(view.state, TaskState::Pending | TaskState::Running) {
                self.pause(view.id).await?;
            }
        }
        Ok(())
    }

    /// Resume every paused task
    pub async fn resume_all(&self) -> Result<()> {
        for id in self.queue.ids_in_state(TaskState::Paused).await {
            self.resume(id).await?;
        }
        Ok(())
    }

    /// Cancel every task that has not finished
    pub async fn cancel_all(&self) -> Result<()> {
        for view in self.queue.snapshot().await {
            if !view.state.is_terminal() {
                self.cancel(view.id).await?;
            }
        }
        Ok(())
    }

    /// Move a task to a new queue position
    ///
    /// Tasks in between shift to keep positions dense. Reordering affects
    /// future dispatch only; a running task keeps running.
    pub async fn reorder(&self, id: TaskId, position: usize) -> Result<()> {
        self.queue.reorder(id, position).await?;
        tracing::debug!(task_id = id.get(), position, "Task reordered");
        self.emit_event(Event::Reordered { id, position });
        Ok(())
    }

    /// Remove all finished tasks (completed, failed, cancelled) from the
    /// queue, returning how many were removed
    pub async fn remove_completed(&self) -> usize {
        let removed = self.queue.remove_finished().await;
        for id in &removed {
            self.limiter.forget_task(*id);
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Removed finished tasks");
        }
        removed.len()
    }

    /// Change the worker-pool parallelism at runtime
    ///
    /// Growing spawns new workers immediately. Shrinking never interrupts
    /// running transfers: excess workers finish their current task and then
    /// retire.
    pub fn set_parallelism(&self, max_parallel: usize) -> Result<()> {
        if max_parallel == 0 {
            return Err(Error::InvalidInput(
                "max_parallel must be at least 1".into(),
            ));
        }

        self.pool.target.store(max_parallel, Ordering::Relaxed);
        self.spawn_workers_up_to(max_parallel);
        // Wake idle workers so excess ones notice the lower target
        self.pool.notify.notify_waiters();

        tracing::info!(max_parallel, "Parallelism changed");
        self.emit_event(Event::ParallelismChanged { max_parallel });
        Ok(())
    }

    /// Change the global or a per-task bandwidth limit at runtime
    ///
    /// `limit_kbps` is in kilobytes per second; 0 removes the limit.
    /// Workers currently waiting in the limiter re-read the limit and
    /// converge on the new ceiling within one chunk.
    pub async fn set_bandwidth_limit(
        &self,
        limit_kbps: u64,
        task: Option<TaskId>,
    ) -> Result<()> {
        let limit_bps = match limit_kbps {
            0 => None,
            kbps => Some(kbps * 1024),
        };

        match task {
            Some(id) => {
                // Reject unknown tasks before touching limiter state
                self.queue.get(id).await?;
                self.limiter.set_task_limit(id, limit_bps);
                tracing::info!(task_id = id.get(), ?limit_bps, "Per-task bandwidth limit changed");
            }
            None => {
                self.limiter.set_global_limit(limit_bps);
                tracing::info!(?limit_bps, "Global bandwidth limit changed");
            }
        }

        self.emit_event(Event::BandwidthLimitChanged { limit_bps, id: task });
        Ok(())
    }
}
