use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use index::{QueueStats, SqliteMetadataStore, StoreError};
use ingest::{Document, IntakeRequest, PipelineState};

use crate::error::PipelineError;

/// What producers hear back about each transition of their documents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub document_id: String,
    pub from: PipelineState,
    pub to: PipelineState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

pub type StatusCallback = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Durable intake queue on top of the documents table. Claims are leases:
/// a document held by a worker stays invisible to others until the lease
/// is released or runs out.
pub struct IntakeQueue {
    store: Arc<SqliteMetadataStore>,
    depth: usize,
    lease: Duration,
    callbacks: Vec<StatusCallback>,
}

impl IntakeQueue {
    pub fn new(store: Arc<SqliteMetadataStore>, depth: usize, lease: Duration) -> Self {
        Self {
            store,
            depth,
            lease,
            callbacks: Vec::new(),
        }
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn store(&self) -> &Arc<SqliteMetadataStore> {
        &self.store
    }

    /// Validate and persist a new `QUEUED` document. The depth check is a
    /// soft bound: concurrent enqueues may overshoot it slightly.
    pub async fn enqueue(&self, request: IntakeRequest) -> Result<Document, PipelineError> {
        let document = request.into_document(Utc::now())?;

        let active = self.store.active_count().await?;
        if active >= self.depth as u64 {
            warn!(
                document_id = %document.document_id,
                active,
                depth = self.depth,
                "Intake queue full, rejecting document"
            );
            return Err(PipelineError::QueueFull { depth: self.depth });
        }

        self.store.insert_document(&document).await?;
        info!(
            document_id = %document.document_id,
            tenant_id = %document.tenant_id,
            priority = document.priority,
            "Document queued"
        );
        Ok(document)
    }

    pub async fn claim(&self, worker_id: &str) -> Result<Option<Document>, StoreError> {
        self.store.claim_next(worker_id, self.lease).await
    }

    pub async fn renew(&self, document_id: &str, worker_id: &str) -> Result<bool, StoreError> {
        self.store.renew_lease(document_id, worker_id, self.lease).await
    }

    /// Return a claim to the worker that held it before; false when `from`
    /// has already lost it.
    pub async fn hand_back(
        &self,
        document_id: &str,
        from: &str,
        to: &str,
    ) -> Result<bool, StoreError> {
        self.store
            .hand_back_lease(document_id, from, to, self.lease)
            .await
    }

    pub async fn release(&self, document_id: &str, worker_id: &str) -> Result<(), StoreError> {
        self.store.release_lease(document_id, worker_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.queue_stats().await
    }

    pub fn report(&self, update: &StatusUpdate) {
        for callback in &self.callbacks {
            callback(update);
        }
    }
}
