use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use ingest::{Document, PipelineState};

use crate::config::AppConfig;
use crate::error::{PipelineError, StageError};
use crate::executor::{Backoff, StageExecutor, StageOutcome};
use crate::metrics::Metrics;
use crate::queue::{IntakeQueue, StatusUpdate};
use crate::stages::{ProcessingContext, StageOutput, Stages};
use crate::state::{has_retry_budget, transition, Event};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub stage_timeout: Duration,
    pub stage_attempts: u32,
    pub max_retries: u32,
    pub poll_interval: Duration,
    /// Delay before a document leaves `RETRY`, by retry number.
    pub retry_backoff: Backoff,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.concurrency.workers,
            stage_timeout: config.stage_timeout(),
            stage_attempts: config.retry.stage_attempts,
            max_retries: config.retry.max_retries,
            poll_interval: config.poll_interval(),
            retry_backoff: Backoff::from_config(&config.retry),
        }
    }
}

/// Removes a document from the active set when processing ends, however
/// it ends.
struct ActiveGuard<'a> {
    active: &'a DashMap<String, String>,
    document_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.document_id);
    }
}

/// Owns the document state machine. Claims documents from the intake
/// queue, runs their stages in order and persists every transition.
pub struct Orchestrator {
    queue: Arc<IntakeQueue>,
    stages: Arc<Stages>,
    executor: StageExecutor,
    metrics: Arc<Metrics>,
    settings: OrchestratorSettings,
    active: DashMap<String, String>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<IntakeQueue>,
        stages: Arc<Stages>,
        executor: StageExecutor,
        metrics: Arc<Metrics>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            queue,
            stages,
            executor,
            metrics,
            settings,
            active: DashMap::new(),
        }
    }

    pub fn queue(&self) -> &Arc<IntakeQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn active_documents(&self) -> usize {
        self.active.len()
    }

    /// Spawn the worker pool. Workers stop between documents once `shutdown`
    /// is cancelled; a document in flight is driven to a terminal state or
    /// left to lease expiry.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> TaskTracker {
        let tracker = TaskTracker::new();
        for n in 0..self.settings.workers.max(1) {
            let orchestrator = Arc::clone(self);
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{}-{n}", std::process::id());
            tracker.spawn(async move { orchestrator.worker_loop(worker_id, shutdown).await });
        }
        tracker.close();
        info!(workers = self.settings.workers.max(1), "Worker pool started");
        tracker
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let idle = match self.process_next(&worker_id).await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Worker failed to process document");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(self.settings.poll_interval) => {}
                }
            }
        }
        info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Claim one document and drive it to a terminal state. Returns false
    /// when there was nothing to claim.
    pub async fn process_next(&self, worker_id: &str) -> Result<bool, PipelineError> {
        let Some(document) = self.queue.claim(worker_id).await? else {
            return Ok(false);
        };
        let document_id = document.document_id.clone();

        let holder = match self.active.entry(document_id.clone()) {
            Entry::Occupied(holder) => Some(holder.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(worker_id.to_string());
                None
            }
        };
        if let Some(holder) = holder {
            // Lease ran out under a live in-process worker; give it back.
            let returned = self.queue.hand_back(&document_id, worker_id, &holder).await?;
            warn!(
                document_id = %document_id,
                worker_id,
                holder = %holder,
                returned,
                "Document already active in this process, handing lease back"
            );
            return Ok(false);
        }
        let _guard = ActiveGuard {
            active: &self.active,
            document_id: document_id.clone(),
        };

        let result = self.drive(document, worker_id).await;
        if let Err(e) = self.queue.release(&document_id, worker_id).await {
            warn!(document_id = %document_id, error = %e, "Failed to release lease");
        }
        result.map(|_| true)
    }

    async fn drive(&self, mut doc: Document, worker_id: &str) -> Result<(), PipelineError> {
        let mut ctx = ProcessingContext::default();

        match doc.current_state {
            PipelineState::Queued => {
                self.advance(&mut doc, worker_id, Event::Start, Some("claimed"))
                    .await?;
            }
            PipelineState::Retry => {
                // Claimed mid-backoff after a crash; stage outputs are gone.
                doc.retry_stage = Some(PipelineState::Classifying);
            }
            stage if stage.is_stage() => {
                warn!(
                    document_id = %doc.document_id,
                    stage = %stage,
                    "Reclaimed document after lease expiry"
                );
                let lost = StageError::Transient("worker lease expired".into());
                self.fail_stage(&mut doc, worker_id, stage, PipelineState::Classifying, lost)
                    .await?;
            }
            _ => return Ok(()),
        }

        loop {
            let state = doc.current_state;
            if state.is_terminal() {
                break;
            }

            if state == PipelineState::Retry {
                let delay = self.settings.retry_backoff.delay(doc.retry_count);
                self.with_heartbeat(&doc.document_id, worker_id, sleep(delay))
                    .await?;
                let target = resume_target(doc.retry_stage, &ctx);
                self.advance(&mut doc, worker_id, Event::Resume(target), Some("retrying"))
                    .await?;
                continue;
            }

            let stages = &self.stages;
            let result = {
                let (doc_ref, ctx_ref) = (&doc, &ctx);
                let run = self.executor.execute(
                    state,
                    &doc.document_id,
                    self.settings.stage_timeout,
                    self.settings.stage_attempts,
                    || stages.run(state, doc_ref, ctx_ref),
                );
                self.with_heartbeat(&doc.document_id, worker_id, run).await?
            };

            match result.outcome {
                StageOutcome::Success(output) => {
                    if let StageOutput::Classified { classification, .. } = &output {
                        doc.document_type = Some(classification.document_type.clone());
                        doc.schema_id = Some(classification.schema_id.clone());
                    }
                    ctx.apply(output);
                    self.advance(&mut doc, worker_id, Event::StageSucceeded, None)
                        .await?;
                }
                StageOutcome::Transient(e) => {
                    self.fail_stage(&mut doc, worker_id, state, state, e).await?;
                }
                StageOutcome::Permanent(e) => {
                    doc.last_error = Some(format!("{state}: {e}"));
                    let reason = doc.last_error.clone();
                    self.advance(&mut doc, worker_id, Event::PermanentFailure, reason.as_deref())
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Run `work` while renewing the lease every third of its length.
    async fn with_heartbeat<F: Future>(
        &self,
        document_id: &str,
        worker_id: &str,
        work: F,
    ) -> Result<F::Output, PipelineError> {
        let period = (self.queue.lease() / 3).max(MIN_HEARTBEAT);
        let mut beats = interval_at(Instant::now() + period, period);
        beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = beats.tick() => {
                    if !self.queue.renew(document_id, worker_id).await? {
                        return Err(PipelineError::LeaseLost(document_id.to_string()));
                    }
                    debug!(document_id, worker_id, "Lease renewed");
                }
            }
        }
    }

    /// Transient failure in `stage`: go to `RETRY` (re-entering `resume_at`)
    /// while budget remains, otherwise `FAILED`.
    async fn fail_stage(
        &self,
        doc: &mut Document,
        worker_id: &str,
        stage: PipelineState,
        resume_at: PipelineState,
        error: StageError,
    ) -> Result<(), PipelineError> {
        let retries_left = has_retry_budget(doc.retry_count, self.settings.max_retries);
        doc.last_error = Some(format!("{stage}: {error}"));
        if retries_left {
            doc.retry_count += 1;
            doc.retry_stage = Some(resume_at);
        }
        let reason = doc.last_error.clone();
        self.advance(
            doc,
            worker_id,
            Event::TransientFailure { retries_left },
            reason.as_deref(),
        )
        .await
    }

    /// Apply `event`, renew the lease, persist the transition and report it.
    async fn advance(
        &self,
        doc: &mut Document,
        worker_id: &str,
        event: Event,
        reason: Option<&str>,
    ) -> Result<(), PipelineError> {
        let from = doc.current_state;
        let to = transition(from, event)?;

        if !self.queue.renew(&doc.document_id, worker_id).await? {
            return Err(PipelineError::LeaseLost(doc.document_id.clone()));
        }

        doc.current_state = to;
        doc.updated_at = Utc::now();
        if from == PipelineState::Retry {
            doc.retry_stage = None;
        }
        self.queue.store().apply_transition(doc, from, reason).await?;

        match to {
            PipelineState::Completed => self.metrics.record_completed(),
            PipelineState::Failed => self.metrics.record_failed(),
            PipelineState::Retry => self.metrics.record_retry(),
            _ => {}
        }

        if to == PipelineState::Failed {
            warn!(
                document_id = %doc.document_id,
                from = %from,
                retry_count = doc.retry_count,
                last_error = ?doc.last_error,
                "Document failed"
            );
        } else {
            info!(
                document_id = %doc.document_id,
                from = %from,
                to = %to,
                retry_count = doc.retry_count,
                "State transition"
            );
        }

        self.queue.report(&StatusUpdate {
            document_id: doc.document_id.clone(),
            from,
            to,
            retry_count: doc.retry_count,
            last_error: doc.last_error.clone(),
            at: doc.updated_at,
        });
        Ok(())
    }
}

/// Stage to re-enter after `RETRY`. Falls back to the first stage when the
/// in-memory outputs the recorded stage needs are gone.
fn resume_target(retry_stage: Option<PipelineState>, ctx: &ProcessingContext) -> PipelineState {
    let wanted = retry_stage.unwrap_or(PipelineState::Classifying);
    let ready = match wanted {
        PipelineState::Classifying => true,
        PipelineState::Extracting => ctx.text.is_some() && ctx.classification.is_some(),
        PipelineState::Chunking => ctx.extraction.is_some(),
        PipelineState::Embedding => ctx.chunks.is_some(),
        PipelineState::Storing => ctx.embeddings.is_some(),
        _ => false,
    };
    if ready {
        wanted
    } else {
        PipelineState::Classifying
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_falls_back_without_outputs() {
        let empty = ProcessingContext::default();
        assert_eq!(
            resume_target(Some(PipelineState::Embedding), &empty),
            PipelineState::Classifying
        );
        assert_eq!(resume_target(None, &empty), PipelineState::Classifying);

        let with_chunks = ProcessingContext {
            chunks: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(
            resume_target(Some(PipelineState::Embedding), &with_chunks),
            PipelineState::Embedding
        );
    }
}
