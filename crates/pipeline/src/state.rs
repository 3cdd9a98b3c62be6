use std::fmt;
use thiserror::Error;

use ingest::PipelineState;

/// Inputs to the document state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A worker picked the document up from the queue.
    Start,
    StageSucceeded,
    /// A stage failed with a retryable error; `retries_left` says whether
    /// the document still has retry budget.
    TransientFailure { retries_left: bool },
    PermanentFailure,
    /// Leave `RETRY` and re-enter the given stage.
    Resume(PipelineState),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Start => f.write_str("start"),
            Event::StageSucceeded => f.write_str("stage_succeeded"),
            Event::TransientFailure { retries_left } => {
                write!(f, "transient_failure(retries_left={retries_left})")
            }
            Event::PermanentFailure => f.write_str("permanent_failure"),
            Event::Resume(stage) => write!(f, "resume({stage})"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("document is terminal in {0}; rejecting {1}")]
    Terminal(PipelineState, Event),
    #[error("no transition from {from} on {event}")]
    Invalid { from: PipelineState, event: Event },
}

/// The stage that follows `state` on success.
pub fn next_state(state: PipelineState) -> Option<PipelineState> {
    match state {
        PipelineState::Queued => Some(PipelineState::Classifying),
        PipelineState::Classifying => Some(PipelineState::Extracting),
        PipelineState::Extracting => Some(PipelineState::Chunking),
        PipelineState::Chunking => Some(PipelineState::Embedding),
        PipelineState::Embedding => Some(PipelineState::Storing),
        PipelineState::Storing => Some(PipelineState::Completed),
        PipelineState::Completed | PipelineState::Failed | PipelineState::Retry => None,
    }
}

/// Whether a transient failure at `retry_count` may still go to `RETRY`.
pub fn has_retry_budget(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}

pub fn transition(state: PipelineState, event: Event) -> Result<PipelineState, TransitionError> {
    use PipelineState::*;

    if state.is_terminal() {
        return Err(TransitionError::Terminal(state, event));
    }

    let next = match (state, event) {
        (Queued, Event::Start) => Some(Classifying),
        (s, Event::StageSucceeded) if s.is_stage() => next_state(s),
        (s, Event::TransientFailure { retries_left }) if s != Retry => {
            Some(if retries_left { Retry } else { Failed })
        }
        (Retry, Event::TransientFailure { retries_left: false }) => Some(Failed),
        (_, Event::PermanentFailure) => Some(Failed),
        (Retry, Event::Resume(stage)) if stage.is_stage() => Some(stage),
        _ => None,
    };

    next.ok_or(TransitionError::Invalid { from: state, event })
}
