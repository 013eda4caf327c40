//! Error types for model-dl
//!
//! Synchronous command errors (bad URL, unknown task, bad position) are
//! returned to the caller immediately. Execution failures never cross the
//! worker boundary as errors — they are recorded on the task and surfaced
//! through the event/snapshot channel.

use thiserror::Error;

/// Result type alias for model-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for model-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before a task was created (invalid or unsupported URL)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No task with the given ID exists in the queue
    #[error("task {id} not found")]
    NotFound {
        /// The task ID that was not found
        id: u64,
    },

    /// Reorder target position is outside the queue bounds
    #[error("invalid position {position} (queue holds {len} tasks)")]
    InvalidPosition {
        /// The requested position
        position: usize,
        /// Current queue length
        len: usize,
    },

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_includes_id() {
        let err = Error::NotFound { id: 42 };
        assert_eq!(err.to_string(), "task 42 not found");
    }

    #[test]
    fn invalid_position_display_includes_bounds() {
        let err = Error::InvalidPosition { position: 9, len: 3 };
        let msg = err.to_string();
        assert!(msg.contains('9'), "message should name the position: {msg}");
        assert!(msg.contains('3'), "message should name the queue length: {msg}");
    }

    #[test]
    fn invalid_input_preserves_reason() {
        let err = Error::InvalidInput("unsupported scheme 'ftp'".into());
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
