//! Error taxonomy for the pipeline core (spec §7).
//!
//! A single [`PipelineError`] enum classifies every failure the core can
//! produce. The HTTP layer maps each variant to a status code and the workers
//! record the [`PipelineError::kind`] tag on failed jobs. `anyhow` is used only
//! at the CLI edge; everything inside the library returns [`Result`].

use thiserror::Error;

/// Library result alias over [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Typed failure classification shared across the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller-supplied input was rejected (bad request, empty document, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The target is busy and the operation cannot proceed concurrently.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// An upstream provider failed. `retryable` records whether a retry may help.
    #[error("upstream error: {message}")]
    Upstream { message: String, retryable: bool },

    /// An internal invariant was violated.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// A storage/database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A filesystem/IO failure.
    #[error("io error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Construct an [`InvalidInput`](PipelineError::InvalidInput) error.
    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidInput(message.into())
    }

    /// Construct a [`NotFound`](PipelineError::NotFound) error.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Construct a [`ResourceBusy`](PipelineError::ResourceBusy) error.
    pub fn busy(message: impl Into<String>) -> Self {
        PipelineError::ResourceBusy(message.into())
    }

    /// Construct an [`Upstream`](PipelineError::Upstream) error.
    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        PipelineError::Upstream {
            message: message.into(),
            retryable,
        }
    }

    /// Whether retrying the operation may succeed. Only retryable upstream
    /// failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Upstream {
                retryable: true,
                ..
            }
        )
    }

    /// Stable tag recorded on failed jobs (`error_kind`).
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::ResourceBusy(_) => "resource_busy",
            PipelineError::Upstream { .. } => "upstream",
            PipelineError::Consistency(_) => "consistency",
            PipelineError::Storage(_) => "storage",
            PipelineError::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}
