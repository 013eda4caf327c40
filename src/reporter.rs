//! Progress reporting with per-task coalescing
//!
//! Workers and Fetchers only bump atomic byte counters; a single reporter
//! task samples those counters on a fixed interval and emits at most one
//! merged `Event::Progress` per task per tick. High-frequency chunk
//! completions therefore never flood subscribers, and a stalled transfer
//! simply stops producing events. Terminal events are emitted directly by
//! the worker on the transition, never delayed by the coalescing interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::queue::TaskQueue;
use crate::types::{Event, TaskId, TaskState};

/// Smoothing factor for the exponential moving average of transfer speed.
/// Higher values react faster to rate changes; lower values damp jitter.
const SPEED_EWMA_ALPHA: f64 = 0.3;

/// Smoothed speed and ETA estimation for one running task
#[derive(Debug)]
pub(crate) struct SpeedEstimator {
    last_bytes: u64,
    smoothed_bps: f64,
}

impl SpeedEstimator {
    pub(crate) fn new(initial_bytes: u64) -> Self {
        Self {
            last_bytes: initial_bytes,
            smoothed_bps: 0.0,
        }
    }

    /// Fold one sample into the moving average and return the smoothed
    /// speed in bytes per second
    pub(crate) fn sample(&mut self, bytes: u64, elapsed: Duration) -> u64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.smoothed_bps as u64;
        }

        let delta = bytes.saturating_sub(self.last_bytes);
        self.last_bytes = bytes;

        let instantaneous = delta as f64 / secs;
        self.smoothed_bps = if self.smoothed_bps == 0.0 {
            instantaneous
        } else {
            SPEED_EWMA_ALPHA * instantaneous + (1.0 - SPEED_EWMA_ALPHA) * self.smoothed_bps
        };
        self.smoothed_bps as u64
    }

    /// Seconds until completion at the current smoothed speed
    pub(crate) fn eta(&self, bytes: u64, total: Option<u64>) -> Option<u64> {
        let total = total?;
        if self.smoothed_bps < 1.0 || total <= bytes {
            return None;
        }
        Some(((total - bytes) as f64 / self.smoothed_bps) as u64)
    }
}

/// Spawn the queue-wide progress reporter
///
/// Runs until the shutdown token fires. Sends are fire-and-forget: a lack
/// of subscribers or a lagged receiver never blocks the reporter.
pub(crate) fn spawn_progress_reporter(
    queue: Arc<TaskQueue>,
    event_tx: broadcast::Sender<Event>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Per-task estimator state, keyed by task id; entries are dropped
        // as soon as a task stops running
        let mut estimators: HashMap<TaskId, (SpeedEstimator, Instant, u64)> = HashMap::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = queue.snapshot().await;
                    let mut running = Vec::new();

                    for view in snapshot {
                        if view.state != TaskState::Running {
                            continue;
                        }
                        running.push(view.id);

                        let bytes = view.bytes_downloaded;
                        let now = Instant::now();

                        let (estimator, last_sample, last_emitted) = estimators
                            .entry(view.id)
                            .or_insert_with(|| (SpeedEstimator::new(0), now, u64::MAX));

                        let elapsed = now.duration_since(*last_sample);
                        let speed_bps = estimator.sample(bytes, elapsed);
                        *last_sample = now;

                        let eta_seconds = estimator.eta(bytes, view.total_bytes);
                        queue.set_rate(view.id, speed_bps, eta_seconds).await;

                        // Coalesce: at most one event per task per tick, and
                        // only when the byte count actually moved
                        if bytes != *last_emitted {
                            *last_emitted = bytes;

                            let percent = view.total_bytes.and_then(|total| {
                                if total > 0 {
                                    Some((bytes as f64 / total as f64 * 100.0) as f32)
                                } else {
                                    None
                                }
                            });

                            event_tx
                                .send(Event::Progress {
                                    id: view.id,
                                    bytes_downloaded: bytes,
                                    total_bytes: view.total_bytes,
                                    speed_bps,
                                    eta_seconds,
                                    percent,
                                })
                                .ok();
                        }
                    }

                    estimators.retain(|id, _| running.contains(id));
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }
    })
}
