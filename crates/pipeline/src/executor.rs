use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use ingest::PipelineState;

use crate::config::RetryConfig;
use crate::error::StageError;
use crate::metrics::{AttemptOutcome, Metrics};

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            factor: config.backoff_factor,
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `retry` (1-based). The cap applies before
    /// jitter, so a delay may exceed `max` by at most the jitter fraction.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let base = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped * (1.0 + spread)).max(0.0))
    }
}

#[derive(Debug)]
pub enum StageOutcome<T> {
    Success(T),
    Transient(StageError),
    Permanent(StageError),
}

#[derive(Debug)]
pub struct StageResult<T> {
    pub stage: PipelineState,
    pub attempts: u32,
    pub elapsed: Duration,
    pub outcome: StageOutcome<T>,
}

impl<T> StageResult<T> {
    pub fn into_result(self) -> Result<T, StageError> {
        match self.outcome {
            StageOutcome::Success(value) => Ok(value),
            StageOutcome::Transient(e) | StageOutcome::Permanent(e) => Err(e),
        }
    }
}

/// Runs one stage call with a timeout, retrying transient failures in place.
/// Holds no state between calls apart from the shared metrics.
#[derive(Clone)]
pub struct StageExecutor {
    backoff: Backoff,
    metrics: Arc<Metrics>,
}

impl StageExecutor {
    pub fn new(backoff: Backoff, metrics: Arc<Metrics>) -> Self {
        Self { backoff, metrics }
    }

    pub async fn execute<T, F, Fut>(
        &self,
        stage: PipelineState,
        document_id: &str,
        stage_timeout: Duration,
        max_attempts: u32,
        mut f: F,
    ) -> StageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let max_attempts = max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let result = match timeout(stage_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StageError::Transient(format!(
                    "timed out after {}ms",
                    stage_timeout.as_millis()
                ))),
            };
            let duration = attempt_started.elapsed();

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(e) if e.is_transient() => AttemptOutcome::Transient,
                Err(_) => AttemptOutcome::Permanent,
            };
            self.metrics.record_attempt(stage, outcome, duration);
            info!(
                stage = %stage,
                document_id,
                attempt,
                duration_ms = duration.as_millis() as u64,
                outcome = outcome.as_str(),
                "Stage attempt finished"
            );

            let outcome = match result {
                Ok(value) => StageOutcome::Success(value),
                Err(e) if !e.is_transient() => StageOutcome::Permanent(e),
                Err(e) if attempt >= max_attempts => StageOutcome::Transient(e),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        stage = %stage,
                        document_id,
                        attempt,
                        max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Stage attempt failed, retrying"
                    );
                    sleep(delay).await;
                    continue;
                }
            };

            return StageResult {
                stage,
                attempts: attempt,
                elapsed: started.elapsed(),
                outcome,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor() -> StageExecutor {
        let backoff = Backoff {
            initial: Duration::from_millis(1),
            factor: 2.0,
            max: Duration::from_millis(4),
            jitter: 0.0,
        };
        StageExecutor::new(backoff, Metrics::new())
    }

    #[test]
    fn delays_grow_then_cap() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let delay = backoff.delay(2).as_secs_f64();
            assert!((1.6..=2.4).contains(&delay), "delay {delay}");
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = executor()
            .execute(PipelineState::Extracting, "doc-1", Duration::from_secs(1), 5, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StageError::Transient("connection refused".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 7);
    }

    #[tokio::test]
    async fn permanent_failure_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: StageResult<()> = executor()
            .execute(PipelineState::Extracting, "doc-1", Duration::from_secs(1), 5, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StageError::Permanent("bad schema".into()))
            })
            .await;

        assert_eq!(result.attempts, 1);
        assert!(matches!(result.outcome, StageOutcome::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient_and_exhaust() {
        let result: StageResult<()> = executor()
            .execute(PipelineState::Embedding, "doc-1", Duration::from_millis(5), 2, || async {
                sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert_eq!(result.attempts, 2);
        match result.outcome {
            StageOutcome::Transient(e) => assert!(e.message().contains("timed out")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn attempts_are_counted_in_metrics() {
        let metrics = Metrics::new();
        let executor = StageExecutor::new(Backoff::default(), metrics.clone());
        executor
            .execute(PipelineState::Chunking, "doc-1", Duration::from_secs(1), 1, || async {
                Ok::<_, StageError>(())
            })
            .await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages["chunking"].successes, 1);
    }
}
