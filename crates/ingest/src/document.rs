use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PRIORITY: u8 = 5;

/// Where a document sits in the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Queued,
    Classifying,
    Extracting,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
    Retry,
}

impl PipelineState {
    pub const STAGES: [PipelineState; 5] = [
        PipelineState::Classifying,
        PipelineState::Extracting,
        PipelineState::Chunking,
        PipelineState::Embedding,
        PipelineState::Storing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Queued => "QUEUED",
            PipelineState::Classifying => "CLASSIFYING",
            PipelineState::Extracting => "EXTRACTING",
            PipelineState::Chunking => "CHUNKING",
            PipelineState::Embedding => "EMBEDDING",
            PipelineState::Storing => "STORING",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
            PipelineState::Retry => "RETRY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// True for the states in which a stage does work.
    pub fn is_stage(&self) -> bool {
        Self::STAGES.contains(self)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown pipeline state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for PipelineState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(PipelineState::Queued),
            "CLASSIFYING" => Ok(PipelineState::Classifying),
            "EXTRACTING" => Ok(PipelineState::Extracting),
            "CHUNKING" => Ok(PipelineState::Chunking),
            "EMBEDDING" => Ok(PipelineState::Embedding),
            "STORING" => Ok(PipelineState::Storing),
            "COMPLETED" => Ok(PipelineState::Completed),
            "FAILED" => Ok(PipelineState::Failed),
            "RETRY" => Ok(PipelineState::Retry),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// One unit of work. Rows are never deleted, only driven to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub tenant_id: String,
    pub source_path: String,
    pub current_state: PipelineState,
    pub priority: u8,
    pub retry_count: u32,
    /// Stage that a `RETRY` re-enters.
    pub retry_stage: Option<PipelineState>,
    pub last_error: Option<String>,
    pub document_type: Option<String>,
    pub schema_id: Option<String>,
    /// Storage step that failed on the last storing attempt.
    pub failed_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum IntakeError {
    #[error("priority must be between 1 and 10, got {0}")]
    InvalidPriority(i64),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
}

/// Body of a processing request handed over by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub document_id: Option<String>,
    pub tenant_id: String,
    pub source_path: String,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl IntakeRequest {
    pub fn new(tenant_id: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            document_id: None,
            tenant_id: tenant_id.into(),
            source_path: source_path.into(),
            priority: None,
        }
    }

    pub fn with_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Validate the request and build the `QUEUED` document it describes.
    pub fn into_document(self, now: DateTime<Utc>) -> Result<Document, IntakeError> {
        if self.tenant_id.trim().is_empty() {
            return Err(IntakeError::MissingField("tenant_id"));
        }
        if self.source_path.trim().is_empty() {
            return Err(IntakeError::MissingField("source_path"));
        }
        let priority = match self.priority {
            None => DEFAULT_PRIORITY,
            Some(p) if (1..=10).contains(&p) => p as u8,
            Some(p) => return Err(IntakeError::InvalidPriority(p)),
        };
        let document_id = match self.document_id {
            Some(id) if !id.trim().is_empty() => id,
            Some(_) => return Err(IntakeError::MissingField("document_id")),
            None => generate_doc_id(),
        };

        Ok(Document {
            document_id,
            tenant_id: self.tenant_id,
            source_path: self.source_path,
            current_state: PipelineState::Queued,
            priority,
            retry_count: 0,
            retry_stage: None,
            last_error: None,
            document_type: None,
            schema_id: None,
            failed_step: None,
            created_at: now,
            updated_at: now,
        })
    }
}

pub fn generate_doc_id() -> String {
    format!("doc-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_its_name() {
        for state in [
            PipelineState::Queued,
            PipelineState::Retry,
            PipelineState::Completed,
            PipelineState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<PipelineState>().unwrap(), state);
        }
        assert!("DONE".parse::<PipelineState>().is_err());
    }

    #[test]
    fn stages_exclude_bookkeeping_states() {
        assert!(PipelineState::Extracting.is_stage());
        assert!(!PipelineState::Queued.is_stage());
        assert!(!PipelineState::Retry.is_stage());
        assert!(PipelineState::Failed.is_terminal());
    }

    #[test]
    fn intake_defaults_priority_and_generates_id() {
        let doc = IntakeRequest::new("acme", "/tmp/a.txt")
            .into_document(Utc::now())
            .unwrap();
        assert_eq!(doc.priority, DEFAULT_PRIORITY);
        assert_eq!(doc.current_state, PipelineState::Queued);
        assert!(doc.document_id.starts_with("doc-"));
    }

    #[test]
    fn intake_rejects_out_of_range_priority() {
        let err = IntakeRequest::new("acme", "/tmp/a.txt")
            .with_priority(11)
            .into_document(Utc::now())
            .unwrap_err();
        assert_eq!(err, IntakeError::InvalidPriority(11));
    }

    #[test]
    fn intake_requires_tenant() {
        let err = IntakeRequest::new(" ", "/tmp/a.txt")
            .into_document(Utc::now())
            .unwrap_err();
        assert_eq!(err, IntakeError::MissingField("tenant_id"));
    }
}
