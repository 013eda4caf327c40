//! Shared fixtures for downloader tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::fetcher::{ChunkSignal, FetchContext, FetchOutcome, FetchRequest, Fetcher};

use super::ModelDownloader;

/// Config tuned for fast tests: short retry delays, quick progress ticks
pub(crate) fn fast_config(max_parallel: usize) -> Config {
    let mut config = Config::default();
    config.queue.max_parallel = max_parallel;
    config.queue.progress_interval = Duration::from_millis(25);
    config.retry.initial_delay = Duration::from_millis(20);
    config.retry.max_delay = Duration::from_millis(100);
    config.retry.jitter = false;
    config
}

pub(crate) fn engine_with(config: Config, fetcher: Arc<dyn Fetcher>) -> ModelDownloader {
    ModelDownloader::new(config, fetcher).unwrap()
}

/// Simulates a chunked transfer, honoring checkpoint and throttle at every
/// chunk boundary the way a real Fetcher must
pub(crate) struct ChunkedFetcher {
    pub(crate) total: u64,
    pub(crate) chunk: u64,
    pub(crate) chunk_delay: Duration,
}

#[async_trait]
impl Fetcher for ChunkedFetcher {
    async fn fetch(&self, _request: FetchRequest, ctx: &FetchContext) -> FetchOutcome {
        let mut sent = 0;
        while sent < self.total {
            match ctx.checkpoint() {
                ChunkSignal::Continue => {}
                ChunkSignal::Pause => return FetchOutcome::Paused,
                ChunkSignal::Cancel => return FetchOutcome::Cancelled,
            }
            let n = self.chunk.min(self.total - sent);
            ctx.throttle(n).await;
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            sent += n;
            ctx.report(n, Some(self.total));
        }
        FetchOutcome::Success {
            bytes: sent,
            metadata: None,
        }
    }
}

/// Fails transiently a fixed number of times, then succeeds
pub(crate) struct FlakyFetcher {
    pub(crate) failures_before_success: u32,
    pub(crate) calls: AtomicU32,
}

impl FlakyFetcher {
    pub(crate) fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Fetcher for FlakyFetcher {
    async fn fetch(&self, _request: FetchRequest, ctx: &FetchContext) -> FetchOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            FetchOutcome::Transient("connection reset".into())
        } else {
            ctx.report(100, Some(100));
            FetchOutcome::Success {
                bytes: 100,
                metadata: None,
            }
        }
    }
}

/// Stalls without ever checkpointing, fails transiently on the first call,
/// then succeeds. Models a connection reset that strikes before the next
/// chunk boundary, so pause/cancel signals are never observed in-flight.
pub(crate) struct StallThenTransientFetcher {
    pub(crate) stall: Duration,
    pub(crate) calls: AtomicU32,
}

impl StallThenTransientFetcher {
    pub(crate) fn new(stall: Duration) -> Self {
        Self {
            stall,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Fetcher for StallThenTransientFetcher {
    async fn fetch(&self, _request: FetchRequest, ctx: &FetchContext) -> FetchOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.stall).await;
        if call == 0 {
            FetchOutcome::Transient("connection reset".into())
        } else {
            ctx.report(100, Some(100));
            FetchOutcome::Success {
                bytes: 100,
                metadata: None,
            }
        }
    }
}

/// Always fails with a permanent error
pub(crate) struct PermanentFailFetcher;

#[async_trait]
impl Fetcher for PermanentFailFetcher {
    async fn fetch(&self, _request: FetchRequest, _ctx: &FetchContext) -> FetchOutcome {
        FetchOutcome::Permanent("404 model not found".into())
    }
}

/// Panics on every fetch, for exercising the worker fault boundary
pub(crate) struct PanickingFetcher;

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, _request: FetchRequest, _ctx: &FetchContext) -> FetchOutcome {
        panic!("fetcher exploded");
    }
}
