//! Core engine implementation split into focused submodules.
//!
//! The `ModelDownloader` struct and its methods are organized by domain:
//! - [`control`] - Task lifecycle control (pause/resume/cancel/reorder)
//! - [`worker`] - Worker-pool execution of claimed tasks

mod control;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{Fetcher, HistorySink, HttpUrlValidator, NoOpHistorySink, UrlValidator};
use crate::queue::TaskQueue;
use crate::rate_limiter::RateLimiter;
use crate::reporter::spawn_progress_reporter;
use crate::retry::RetryPolicy;
use crate::types::{Event, QueueStats, TaskId, TaskOptions, TaskView};

/// Worker-pool bookkeeping
///
/// `target` is the desired parallelism; `live` counts spawned workers that
/// have not yet retired. A worker retires between tasks when `live` exceeds
/// `target`. `notify` wakes idle workers when something becomes
/// dispatchable.
pub(crate) struct PoolState {
    pub(crate) target: AtomicUsize,
    pub(crate) live: std::sync::Mutex<usize>,
    pub(crate) notify: Notify,
}

/// Main engine instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct ModelDownloader {
    /// Task queue holding every task and its state
    pub(crate) queue: Arc<TaskQueue>,
    /// Global + per-task bandwidth limiter shared with all workers
    pub(crate) limiter: RateLimiter,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration
    pub(crate) config: Arc<Config>,
    /// Retry policy for transient transfer failures
    pub(crate) retry: RetryPolicy,
    /// Byte-transfer collaborator supplied by the consumer
    pub(crate) fetcher: Arc<dyn Fetcher>,
    /// URL validation collaborator
    pub(crate) validator: Arc<dyn UrlValidator>,
    /// History sink notified of terminal transitions (fire and forget)
    pub(crate) history: Arc<dyn HistorySink>,
    /// Worker-pool bookkeeping
    pub(crate) pool: Arc<PoolState>,
    /// Cancelled once on shutdown; stops the reporter and idle workers
    pub(crate) shutdown: CancellationToken,
    /// Flag cleared during shutdown so enqueue is rejected
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl ModelDownloader {
    /// Create a new engine with the default URL validator and a no-op
    /// history sink
    ///
    /// Must be called from within a tokio runtime; the worker pool and the
    /// progress reporter are spawned immediately.
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        Self::with_collaborators(
            config,
            fetcher,
            Arc::new(HttpUrlValidator),
            Arc::new(NoOpHistorySink),
        )
    }

    /// Create a new engine with explicit validator and history collaborators
    pub fn with_collaborators(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        validator: Arc<dyn UrlValidator>,
        history: Arc<dyn HistorySink>,
    ) -> Result<Self> {
        if config.queue.max_parallel == 0 {
            return Err(Error::InvalidInput(
                "max_parallel must be at least 1".into(),
            ));
        }

        // Buffer size of 1000 events allows multiple subscribers to receive
        // all events independently
        let (event_tx, _rx) = broadcast::channel(1000);

        let limiter = RateLimiter::new(config.bandwidth_limit_bps());
        let retry = RetryPolicy::new(config.retry.clone());
        let max_parallel = config.queue.max_parallel;
        let progress_interval = config.queue.progress_interval;

        let engine = Self {
            queue: Arc::new(TaskQueue::new()),
            limiter,
            event_tx,
            config: Arc::new(config),
            retry,
            fetcher,
            validator,
            history,
            pool: Arc::new(PoolState {
                target: AtomicUsize::new(max_parallel),
                live: std::sync::Mutex::new(0),
                notify: Notify::new(),
            }),
            shutdown: CancellationToken::new(),
            accepting_new: Arc::new(AtomicBool::new(true)),
        };

        spawn_progress_reporter(
            Arc::clone(&engine.queue),
            engine.event_tx.clone(),
            progress_interval,
            engine.shutdown.clone(),
        );

        engine.spawn_workers_up_to(max_parallel);

        tracing::info!(
            max_parallel,
            bandwidth_limit_bps = ?engine.limiter.global_limit(),
            "Download engine started"
        );

        Ok(engine)
    }

    /// Validate a raw URL and append a new pending task
    ///
    /// Returns `Error::InvalidInput` without creating a task when the URL
    /// fails validation, and `Error::ShuttingDown` once shutdown started.
    pub async fn enqueue(&self, raw_url: &str, options: TaskOptions) -> Result<TaskId> {
        if !self.accepting_new.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }

        let url = self.validator.validate(raw_url)?;
        if options.bandwidth_cap_bps == Some(0) {
            return Err(Error::InvalidInput(
                "per-task bandwidth cap must be nonzero (omit it for uncapped)".into(),
            ));
        }

        let cap = options.bandwidth_cap_bps;
        let id = self.queue.enqueue(url.clone(), options).await;
        if let Some(cap) = cap {
            self.limiter.set_task_limit(id, Some(cap));
        }

        tracing::info!(task_id = id.get(), url = %url, "Task enqueued");
        self.emit_event(Event::Queued { id, url });
        self.pool.notify.notify_waiters();

        Ok(id)
    }

    /// Subscribe to lifecycle and progress events
    ///
    /// Each receiver gets an independent stream. A receiver that falls more
    /// than the channel capacity behind observes `Lagged` and should re-sync
    /// from [`snapshot`](Self::snapshot).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Consistent snapshot of every task, in dispatch order
    pub async fn snapshot(&self) -> Vec<TaskView> {
        self.queue.snapshot().await
    }

    /// Snapshot of a single task
    pub async fn get(&self, id: TaskId) -> Result<TaskView> {
        self.queue.get(id).await
    }

    /// Aggregate queue statistics
    pub async fn stats(&self) -> QueueStats {
        self.queue
            .stats(
                self.limiter.global_limit(),
                self.accepting_new.load(Ordering::Relaxed),
            )
            .await
    }

    /// Total bytes admitted through the bandwidth limiter since startup
    pub fn total_bytes(&self) -> u64 {
        self.limiter.total_bytes()
    }

    /// Begin graceful shutdown
    ///
    /// Stops accepting new tasks, signals running transfers to stop at
    /// their next chunk boundary, and retires workers and the reporter.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.accepting_new.swap(false, Ordering::Relaxed) {
            return;
        }

        tracing::info!("Shutting down download engine");
        self.emit_event(Event::Shutdown);

        // Cooperatively stop running transfers
        for id in self
            .queue
            .ids_in_state(crate::types::TaskState::Running)
            .await
        {
            let _ = self.queue.cancel(id).await;
        }

        self.shutdown.cancel();
        self.pool.notify.notify_waiters();
    }

    /// Send an event to all subscribers; a send failure only means nobody
    /// is listening
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Notify the history sink about a task that just reached a terminal
    /// state, without blocking the caller
    pub(crate) async fn record_history(&self, id: TaskId, metadata: Option<serde_json::Value>) {
        let Some(mut record) = self.queue.history_record(id).await else {
            return;
        };
        record.metadata = metadata;

        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            history.record(record).await;
        });
    }

    /// Spawn workers until `live` reaches the given target
    pub(crate) fn spawn_workers_up_to(&self, target: usize) {
        let mut live = self.pool.live.lock().unwrap_or_else(|e| e.into_inner());
        while *live < target {
            *live += 1;
            worker::spawn_worker(self.clone());
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
