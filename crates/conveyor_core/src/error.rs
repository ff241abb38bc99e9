//! Core error types for CONVEYOR.

/// Core result type
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline error type
///
/// Admission errors are produced by the scheduler before any work starts.
/// Everything raised by user code (handlers, post-handlers, loaders, chain
/// maps) travels as [`PipelineError::Handler`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The scheduler queue is over its bound; the call was rejected
    #[error("Queue limit reached: {limit}")]
    QueueLimitReached {
        /// Configured queue limit
        limit: usize,
    },

    /// No input data was passed and the executor has no default
    #[error("No input data and no default data configured")]
    MissingData,

    /// A scheduled task was dropped before it settled
    #[error("Task abandoned before completion")]
    Abandoned,

    /// Failure raised by a handler, loader or chain map
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl PipelineError {
    /// Build a handler failure from a plain message
    #[must_use]
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(anyhow::anyhow!("{message}"))
    }

    /// Whether this error is an admission rejection
    #[must_use]
    pub const fn is_admission(&self) -> bool {
        matches!(self, Self::QueueLimitReached { .. })
    }
}
