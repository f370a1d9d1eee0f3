//! Error types for the workflow-management domain.

/// The result type used throughout tally-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in workflow-management operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A core (storage, clock, configuration) error.
    #[error(transparent)]
    Core(#[from] tally_core::error::Error),

    /// A batch object key carried an unparseable timestamp.
    #[error("unparseable batch key {key}: {message}")]
    BatchPath {
        /// The offending object key stem.
        key: String,
        /// Description of the parse failure.
        message: String,
    },

    /// The orchestrator could not be reached or answered unexpectedly.
    #[error("orchestrator error: {message}")]
    Orchestrator {
        /// Description of the orchestrator failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A task-queue publish or queue administration call failed.
    #[error("task queue error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A task payload could not be serialized to JSON.
    #[error("serializing task to JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A batch appeared in a group with a different aggregation ID.
    /// Indicates upstream data corruption.
    #[error("found batch with aggregation ID {found}, wanted {wanted}")]
    AggregationIdMismatch {
        /// The aggregation ID carried by the batch.
        found: String,
        /// The aggregation ID of the group.
        wanted: String,
    },

    /// Own and peer validations disagree on the timestamp of one batch.
    /// Indicates upstream data corruption.
    #[error("own and peer validations disagree on time for batch {batch_id}: {own} vs {peer}")]
    ValidationTimeMismatch {
        /// The batch whose timestamps diverge.
        batch_id: String,
        /// Timestamp carried by the own validation.
        own: String,
        /// Timestamp carried by the peer validation.
        peer: String,
    },

    /// Invalid configuration was provided.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new orchestrator error with a source cause.
    #[must_use]
    pub fn orchestrator_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Orchestrator {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
