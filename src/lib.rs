//! # model-dl
//!
//! Embeddable download task queue and worker-pool engine for long-running
//! model downloads from a remote model-hosting API.
//!
//! ## Design Philosophy
//!
//! model-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Interactive** - Pause, resume, cancel, reorder, and throttle tasks
//!   while transfers are in flight
//! - **Transport-agnostic** - Byte transfer, URL validation, and history
//!   persistence are traits supplied by the consumer
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use model_dl::{Config, Fetcher, ModelDownloader, TaskOptions};
//!
//! # fn my_fetcher() -> Arc<dyn Fetcher> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.queue.max_parallel = 2;
//!
//!     let engine = ModelDownloader::new(config, my_fetcher())?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let id = engine
//!         .enqueue("https://models.example.com/api/models/42", TaskOptions::default())
//!         .await?;
//!     engine.set_bandwidth_limit(500, None).await?; // 500 KB/s global
//!     engine.pause(id).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Core engine implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Collaborator traits and the per-transfer execution context
pub mod fetcher;
/// Bandwidth limiting with token buckets
pub mod rate_limiter;
/// Retry policy with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

mod queue;
mod reporter;

// Re-export commonly used types
pub use config::{Config, QueueConfig, RetryConfig};
pub use downloader::ModelDownloader;
pub use error::{Error, Result};
pub use fetcher::{
    ChunkSignal, FetchContext, FetchOutcome, FetchRequest, Fetcher, HistoryRecord, HistorySink,
    HttpUrlValidator, NoOpHistorySink, TaskControl, TaskProgress, UrlValidator,
};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use types::{
    DownloadScope, Event, QueueStats, TaskId, TaskOptions, TaskState, TaskView,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: ModelDownloader) {
    wait_for_signal().await;
    engine.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
