//! Worker-pool execution of claimed tasks.
//!
//! Each worker loops: claim the next dispatchable task, hand it to the
//! Fetcher, classify the outcome, repeat. Idle workers park on the pool's
//! `Notify` (armed before the claim attempt, so an enqueue between the
//! failed claim and the wait is never missed). A worker retires between
//! tasks when the pool target shrank below the live count.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::fetcher::{FetchContext, FetchOutcome, FetchRequest};
use crate::queue::Claim;
use crate::types::{Event, TaskId};

use super::ModelDownloader;

pub(crate) fn spawn_worker(engine: ModelDownloader) {
    tokio::spawn(async move {
        worker_loop(&engine).await;
    });
}

async fn worker_loop(engine: &ModelDownloader) {
    loop {
        if engine.shutdown.is_cancelled() {
            break;
        }

        // Retire between tasks if the pool shrank
        {
            let mut live = engine.pool.live.lock().unwrap_or_else(|e| e.into_inner());
            if *live > engine.pool.target.load(Ordering::Relaxed) {
                *live -= 1;
                tracing::debug!("Worker retired after pool shrink");
                return;
            }
        }

        // Arm the wakeup before trying to claim, so a task enqueued between
        // a failed claim and the wait still wakes us
        let wakeup = engine.pool.notify.notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();

        if let Some(claim) = engine.queue.claim_next().await {
            engine.run_claim(claim).await;
            continue;
        }

        tokio::select! {
            _ = &mut wakeup => {}
            _ = engine.shutdown.cancelled() => break,
        }
    }

    let mut live = engine.pool.live.lock().unwrap_or_else(|e| e.into_inner());
    *live = live.saturating_sub(1);
}

impl ModelDownloader {
    /// Execute one claimed attempt end to end
    pub(crate) async fn run_claim(&self, claim: Claim) {
        let id = claim.id;
        let attempt = claim.attempt;

        tracing::info!(
            task_id = id.get(),
            attempt,
            url = %claim.url,
            "Starting download"
        );
        self.emit_event(Event::Started { id, attempt });

        let ctx = FetchContext::new(
            id,
            self.limiter.clone(),
            claim.progress.clone(),
            claim.control.clone(),
        );
        let request = FetchRequest {
            id,
            url: claim.url.clone(),
            scope: claim.scope,
            destination: claim.destination.clone(),
            attempt,
        };

        // Fault boundary: a panicking Fetcher fails the task, not the worker
        let outcome = AssertUnwindSafe(self.fetcher.fetch(request, &ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(FetchOutcome::Success { bytes, metadata }) => {
                self.queue.mark_completed(id).await;
                self.limiter.forget_task(id);
                tracing::info!(task_id = id.get(), bytes, "Download completed");
                self.emit_event(Event::Completed {
                    id,
                    bytes_downloaded: bytes,
                });
                self.record_history(id, metadata).await;
            }
            Ok(FetchOutcome::Transient(error)) => {
                self.handle_transient(&claim, error).await;
            }
            Ok(FetchOutcome::Permanent(error)) => {
                tracing::error!(task_id = id.get(), error = %error, "Download failed permanently");
                self.finalize_failed(id, error, attempt).await;
            }
            Ok(FetchOutcome::Paused) => {
                // A cancel may have landed after the fetch observed the
                // pause; cancel wins
                if claim.control.cancel.is_cancelled() {
                    self.finalize_cancelled(id).await;
                } else {
                    self.queue.mark_paused(id).await;
                    tracing::info!(task_id = id.get(), "Download paused");
                    self.emit_event(Event::Paused { id });
                }
            }
            Ok(FetchOutcome::Cancelled) => {
                self.finalize_cancelled(id).await;
            }
            Err(panic) => {
                let msg = panic_message(panic);
                tracing::error!(task_id = id.get(), error = %msg, "Fetcher panicked");
                self.finalize_failed(id, format!("internal fault: {msg}"), attempt)
                    .await;
            }
        }
    }

    /// Apply the retry policy to a transient failure
    ///
    /// A cancel or pause issued during the failed attempt must not be lost
    /// to the retry path; cancel wins over pause.
    async fn handle_transient(&self, claim: &Claim, error: String) {
        let id = claim.id;
        let attempt = claim.attempt;

        if claim.control.cancel.is_cancelled() {
            self.finalize_cancelled(id).await;
            return;
        }
        if claim.control.paused.load(Ordering::Relaxed) {
            self.queue.mark_paused(id).await;
            tracing::info!(task_id = id.get(), "Download paused");
            self.emit_event(Event::Paused { id });
            return;
        }

        match self.retry.next_delay(attempt) {
            Some(delay) => {
                tracing::warn!(
                    task_id = id.get(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retry scheduled"
                );

                self.queue
                    .schedule_retry(id, Instant::now() + delay, error.clone())
                    .await;
                self.emit_event(Event::RetryScheduled {
                    id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                });

                // Wake the pool when the backoff elapses; the worker slot
                // is free in the meantime
                let notify_pool = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            notify_pool.pool.notify.notify_waiters();
                        }
                        _ = notify_pool.shutdown.cancelled() => {}
                    }
                });
            }
            None => {
                tracing::error!(
                    task_id = id.get(),
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                self.finalize_failed(id, error, attempt).await;
            }
        }
    }

    async fn finalize_failed(&self, id: TaskId, error: String, attempts: u32) {
        self.queue.mark_failed(id, error.clone()).await;
        self.limiter.forget_task(id);
        self.emit_event(Event::Failed {
            id,
            error,
            attempts,
        });
        self.record_history(id, None).await;
    }

    async fn finalize_cancelled(&self, id: TaskId) {
        self.queue.mark_cancelled(id).await;
        self.limiter.forget_task(id);
        tracing::info!(task_id = id.get(), "Download cancelled");
        self.emit_event(Event::Cancelled { id });
        self.record_history(id, None).await;
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
