use ingest::PipelineState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a single stage attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Transient,
    Permanent,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Transient => "transient",
            AttemptOutcome::Permanent => "permanent",
        }
    }
}

#[derive(Default)]
struct StageCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
    total_time_us: AtomicU64,
}

impl StageCounters {
    fn snapshot(&self) -> StageSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let total_us = self.total_time_us.load(Ordering::Relaxed);
        StageSnapshot {
            attempts,
            successes: self.successes.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            total_time_ms: total_us as f64 / 1000.0,
            avg_time_ms: if attempts > 0 {
                total_us as f64 / attempts as f64 / 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Process-wide counters, shared by the executor and orchestrator.
pub struct Metrics {
    stages: [StageCounters; 5],
    documents_completed: AtomicU64,
    documents_failed: AtomicU64,
    documents_retried: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stages: Default::default(),
            documents_completed: AtomicU64::new(0),
            documents_failed: AtomicU64::new(0),
            documents_retried: AtomicU64::new(0),
        })
    }

    fn counters(&self, stage: PipelineState) -> Option<&StageCounters> {
        PipelineState::STAGES
            .iter()
            .position(|s| *s == stage)
            .map(|i| &self.stages[i])
    }

    pub fn record_attempt(&self, stage: PipelineState, outcome: AttemptOutcome, duration: Duration) {
        let Some(counters) = self.counters(stage) else {
            return;
        };
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        counters
            .total_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        let counter = match outcome {
            AttemptOutcome::Success => &counters.successes,
            AttemptOutcome::Transient => &counters.transient_failures,
            AttemptOutcome::Permanent => &counters.permanent_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.documents_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.documents_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stages = PipelineState::STAGES
            .iter()
            .zip(&self.stages)
            .map(|(stage, counters)| (stage.as_str().to_lowercase(), counters.snapshot()))
            .collect();

        MetricsSnapshot {
            stages,
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            documents_retried: self.documents_retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub total_time_ms: f64,
    pub avg_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageSnapshot>,
    pub documents_completed: u64,
    pub documents_failed: u64,
    pub documents_retried: u64,
}
