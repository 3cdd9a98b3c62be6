use thiserror::Error;

use extract::{ExtractionError, LlmError};
use index::{EmbeddingError, StorageError, StoreError};
use ingest::{ChunkingError, IntakeError, ReadError};

use crate::state::TransitionError;

/// Failure of one stage call, already classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(m) | StageError::Permanent(m) => m,
        }
    }

    fn classify(transient: bool, message: String) -> Self {
        if transient {
            StageError::Transient(message)
        } else {
            StageError::Permanent(message)
        }
    }
}

impl From<ReadError> for StageError {
    fn from(e: ReadError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

impl From<LlmError> for StageError {
    fn from(e: LlmError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

impl From<ExtractionError> for StageError {
    fn from(e: ExtractionError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

impl From<ChunkingError> for StageError {
    fn from(e: ChunkingError) -> Self {
        StageError::Permanent(e.to_string())
    }
}

impl From<EmbeddingError> for StageError {
    fn from(e: EmbeddingError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        Self::classify(e.is_transient(), e.to_string())
    }
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error("document {0} already exists")]
    Duplicate(String),
    #[error("intake queue is full ({depth} documents in flight)")]
    QueueFull { depth: usize },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("lease on document {0} was lost to another worker")]
    LeaseLost(String),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(id) => PipelineError::Duplicate(id),
            other => PipelineError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_source_errors() {
        let transient: StageError = LlmError::Timeout.into();
        assert!(transient.is_transient());

        let permanent: StageError = ReadError::UnsupportedFormat("a.pdf".into()).into();
        assert!(!permanent.is_transient());

        let duplicate: PipelineError = StoreError::Duplicate("doc-1".into()).into();
        assert!(matches!(duplicate, PipelineError::Duplicate(id) if id == "doc-1"));
    }
}
