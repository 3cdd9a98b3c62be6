use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use extract::{EntityRelationship, ExtractedEntity};
use ingest::DocumentChunk;

use crate::embeddings::{entity_text, Embedding, OwnerKind};
use crate::error::StoreError;
use crate::graph_builder::GraphBuilder;
use crate::metadata::SqliteMetadataStore;
use crate::{point_id, VectorPoint, VectorStore};

/// Checkpoints of the write path, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStep {
    RelationalPending,
    Graph,
    Vector,
    Commit,
    Prune,
}

impl StorageStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStep::RelationalPending => "relational_pending",
            StorageStep::Graph => "graph",
            StorageStep::Vector => "vector",
            StorageStep::Commit => "commit",
            StorageStep::Prune => "prune",
        }
    }
}

impl fmt::Display for StorageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("storage failed at {step}: {source}")]
pub struct StorageError {
    pub step: StorageStep,
    #[source]
    pub source: StoreError,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        self.source.is_transient()
    }
}

/// Everything a document contributes to the stores.
#[derive(Debug, Clone, Copy)]
pub struct StorageBatch<'a> {
    pub tenant_id: &'a str,
    pub document_id: &'a str,
    pub model_version: &'a str,
    pub entities: &'a [ExtractedEntity],
    pub relationships: &'a [EntityRelationship],
    pub chunks: &'a [DocumentChunk],
    pub embeddings: &'a [Embedding],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageSummary {
    pub entities: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub edges: usize,
}

/// Ordered, idempotent writes across the relational, graph and vector
/// stores, made visible by a single relational commit at the end.
pub struct StorageCoordinator {
    metadata: Arc<SqliteMetadataStore>,
    graph: GraphBuilder,
    vectors: Arc<dyn VectorStore>,
}

impl StorageCoordinator {
    pub fn new(
        metadata: Arc<SqliteMetadataStore>,
        graph: GraphBuilder,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            metadata,
            graph,
            vectors,
        }
    }

    pub async fn store(&self, batch: StorageBatch<'_>) -> Result<StorageSummary, StorageError> {
        match self.write_all(&batch).await {
            Ok(summary) => {
                info!(
                    document_id = batch.document_id,
                    entities = summary.entities,
                    chunks = summary.chunks,
                    vectors = summary.vectors,
                    edges = summary.edges,
                    "Committed document"
                );
                Ok(summary)
            }
            Err(e) => {
                // No rollback; a re-run overwrites everything written so far.
                if let Err(mark) = self
                    .metadata
                    .set_failed_step(batch.document_id, Some(e.step.as_str()))
                    .await
                {
                    warn!(
                        document_id = batch.document_id,
                        error = %mark,
                        "Could not record failed storage step"
                    );
                }
                warn!(
                    document_id = batch.document_id,
                    step = %e.step,
                    transient = e.is_transient(),
                    error = %e.source,
                    "Storage step failed"
                );
                Err(e)
            }
        }
    }

    async fn write_all(&self, batch: &StorageBatch<'_>) -> Result<StorageSummary, StorageError> {
        let keyed: Vec<(Embedding, u64)> = batch
            .embeddings
            .iter()
            .map(|e| (e.clone(), point_id(&e.owner_id, &e.model_version)))
            .collect();

        self.metadata
            .write_pending(
                batch.document_id,
                batch.entities,
                batch.chunks,
                &keyed,
                batch.model_version,
            )
            .await
            .map_err(at(StorageStep::RelationalPending))?;

        let graph = self
            .graph
            .write(
                batch.tenant_id,
                batch.document_id,
                batch.entities,
                batch.relationships,
            )
            .await
            .map_err(at(StorageStep::Graph))?;

        let points = vector_points(batch, keyed);
        if let Some(first) = points.first() {
            self.vectors
                .ensure_collection(first.vector.len())
                .await
                .map_err(at(StorageStep::Vector))?;
            self.vectors
                .upsert(&points)
                .await
                .map_err(at(StorageStep::Vector))?;
        }

        self.metadata
            .commit_document(batch.document_id)
            .await
            .map_err(at(StorageStep::Commit))?;

        self.prune(batch).await.map_err(at(StorageStep::Prune))?;

        Ok(StorageSummary {
            entities: batch.entities.len(),
            chunks: batch.chunks.len(),
            vectors: points.len(),
            edges: graph.edges,
        })
    }

    /// Delete graph and vector data an earlier run wrote and this one
    /// replaced. Runs after commit, so a failure here leaves only unreachable
    /// leftovers that the next run of the document removes.
    async fn prune(&self, batch: &StorageBatch<'_>) -> Result<(), StoreError> {
        self.graph
            .prune(batch.document_id, batch.entities, batch.relationships)
            .await?;
        let stale = self.metadata.superseded_points(batch.document_id).await?;
        self.vectors.delete(&stale).await?;
        self.metadata.purge_superseded(batch.document_id).await?;
        if !stale.is_empty() {
            debug!(
                document_id = batch.document_id,
                points = stale.len(),
                "Pruned superseded vectors"
            );
        }
        Ok(())
    }
}

fn at(step: StorageStep) -> impl Fn(StoreError) -> StorageError {
    move |source| StorageError { step, source }
}

fn vector_points(batch: &StorageBatch<'_>, keyed: Vec<(Embedding, u64)>) -> Vec<VectorPoint> {
    keyed
        .into_iter()
        .map(|(embedding, point_id)| {
            let text = match embedding.owner_kind {
                OwnerKind::Chunk => batch
                    .chunks
                    .iter()
                    .find(|c| c.chunk_id == embedding.owner_id)
                    .map(|c| c.text.clone()),
                OwnerKind::Entity => batch
                    .entities
                    .iter()
                    .find(|e| e.entity_id == embedding.owner_id)
                    .map(entity_text),
            }
            .unwrap_or_default();

            VectorPoint {
                point_id,
                owner_id: embedding.owner_id,
                owner_kind: embedding.owner_kind,
                model_version: embedding.model_version,
                tenant_id: batch.tenant_id.to_string(),
                document_id: batch.document_id.to_string(),
                vector: embedding.vector,
                text,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryGraphStore, MemoryVectorStore};
    use chrono::Utc;
    use ingest::IntakeRequest;

    struct Fixture {
        metadata: Arc<SqliteMetadataStore>,
        graph: Arc<MemoryGraphStore>,
        vectors: Arc<MemoryVectorStore>,
        coordinator: StorageCoordinator,
    }

    async fn fixture() -> Fixture {
        let metadata = Arc::new(SqliteMetadataStore::in_memory().await.unwrap());
        let doc = IntakeRequest::new("tenant-a", "/tmp/doc.txt")
            .with_id("doc-1")
            .into_document(Utc::now())
            .unwrap();
        metadata.insert_document(&doc).await.unwrap();

        let graph = Arc::new(MemoryGraphStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let coordinator = StorageCoordinator::new(
            metadata.clone(),
            GraphBuilder::new(graph.clone()),
            vectors.clone(),
        );
        Fixture {
            metadata,
            graph,
            vectors,
            coordinator,
        }
    }

    fn sample() -> (Vec<ExtractedEntity>, Vec<DocumentChunk>, Vec<Embedding>) {
        let entity = ExtractedEntity {
            entity_id: "e-alice".into(),
            document_id: "doc-1".into(),
            entity_type: "person".into(),
            normalized_value: "Alice".into(),
            confidence: 0.9,
            raw_span: "Alice".into(),
            spans: vec![(0, 5)],
        };
        let chunk = DocumentChunk::new("doc-1", 0, "Alice signed.", (0, 13), vec!["e-alice".into()]);
        let embeddings = vec![
            Embedding {
                owner_id: chunk.chunk_id.clone(),
                owner_kind: OwnerKind::Chunk,
                vector: vec![1.0, 0.0],
                model_version: "m1".into(),
            },
            Embedding {
                owner_id: entity.entity_id.clone(),
                owner_kind: OwnerKind::Entity,
                vector: vec![0.0, 1.0],
                model_version: "m1".into(),
            },
        ];
        (vec![entity], vec![chunk], embeddings)
    }

    fn batch<'a>(
        entities: &'a [ExtractedEntity],
        chunks: &'a [DocumentChunk],
        embeddings: &'a [Embedding],
    ) -> StorageBatch<'a> {
        StorageBatch {
            tenant_id: "tenant-a",
            document_id: "doc-1",
            model_version: "m1",
            entities,
            relationships: &[],
            chunks,
            embeddings,
        }
    }

    #[tokio::test]
    async fn writes_all_stores_then_commits() {
        let f = fixture().await;
        let (entities, chunks, embeddings) = sample();

        let summary = f
            .coordinator
            .store(batch(&entities, &chunks, &embeddings))
            .await
            .unwrap();

        assert_eq!(summary.vectors, 2);
        assert_eq!(f.graph.node_count(), 1);
        assert_eq!(f.vectors.len(), 2);
        assert_eq!(f.metadata.committed_entities("doc-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn vector_failure_records_step_and_rerun_converges() {
        let f = fixture().await;
        let (entities, chunks, embeddings) = sample();

        f.vectors.set_unavailable(true);
        let err = f
            .coordinator
            .store(batch(&entities, &chunks, &embeddings))
            .await
            .unwrap_err();
        assert_eq!(err.step, StorageStep::Vector);
        assert!(err.is_transient());

        let doc = f.metadata.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.failed_step.as_deref(), Some("vector"));
        assert!(f.metadata.committed_entities("doc-1").await.unwrap().is_empty());
        assert_eq!(f.graph.node_count(), 1);

        f.vectors.set_unavailable(false);
        f.coordinator
            .store(batch(&entities, &chunks, &embeddings))
            .await
            .unwrap();

        assert_eq!(f.graph.node_count(), 1);
        assert_eq!(f.vectors.len(), 2);
        assert_eq!(f.metadata.committed_entities("doc-1").await.unwrap().len(), 1);
        let doc = f.metadata.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(doc.failed_step, None);
    }

    #[tokio::test]
    async fn rerun_removes_replaced_nodes_and_vectors() {
        let f = fixture().await;
        let (entities, chunks, embeddings) = sample();
        f.coordinator
            .store(batch(&entities, &chunks, &embeddings))
            .await
            .unwrap();
        let old_entity_point = point_id("e-alice", "m1");
        assert!(f.vectors.contains(old_entity_point));

        let bob = ExtractedEntity {
            entity_id: "e-bob".into(),
            normalized_value: "Bob".into(),
            raw_span: "Bob".into(),
            spans: vec![(0, 3)],
            ..entities[0].clone()
        };
        let chunk = DocumentChunk::new("doc-1", 0, "Bob signed.", (0, 11), vec!["e-bob".into()]);
        let rerun_embeddings = vec![
            Embedding {
                owner_id: chunk.chunk_id.clone(),
                owner_kind: OwnerKind::Chunk,
                vector: vec![1.0, 0.0],
                model_version: "m1".into(),
            },
            Embedding {
                owner_id: "e-bob".into(),
                owner_kind: OwnerKind::Entity,
                vector: vec![0.0, 1.0],
                model_version: "m1".into(),
            },
        ];
        let rerun_entities = vec![bob];
        let rerun_chunks = vec![chunk];
        f.coordinator
            .store(batch(&rerun_entities, &rerun_chunks, &rerun_embeddings))
            .await
            .unwrap();

        assert_eq!(f.graph.node_count(), 1);
        assert!(f.graph.node("e-alice").is_none());
        assert!(f.graph.node("e-bob").is_some());
        assert!(!f.vectors.contains(old_entity_point));
        assert!(f.vectors.contains(point_id("e-bob", "m1")));
        assert_eq!(f.vectors.len(), 2);
        assert!(f.metadata.superseded_points("doc-1").await.unwrap().is_empty());
    }
}
