pub mod coordinator;
pub mod embeddings;
pub mod error;
pub mod graph_builder;
pub mod memory;
pub mod metadata;
pub mod neo4j_index;
pub mod qdrant_index;
pub mod search;

pub use coordinator::{
    StorageBatch, StorageCoordinator, StorageError, StorageStep, StorageSummary,
};
pub use embeddings::{
    Embedder, Embedding, EmbeddingBackend, EmbeddingClient, EmbeddingError, OwnerKind,
};
pub use error::StoreError;
pub use graph_builder::{GraphBuilder, GraphWriteSummary};
pub use memory::{MemoryGraphStore, MemoryVectorStore};
pub use metadata::{QueueStats, SqliteMetadataStore, TransitionRecord, VisibleChunk};
pub use neo4j_index::Neo4jGraphStore;
pub use qdrant_index::QdrantVectorStore;
pub use search::{SearchError, SearchHit, SearchRequest, SearchResponse, SearchService};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use extract::{EntityRelationship, ExtractedEntity};

/// Graph side of the storage fan-out. Writes must be idempotent: an entity
/// is merged on its id and an edge on (source, target, type).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entity(&self, tenant_id: &str, entity: &ExtractedEntity)
        -> Result<(), StoreError>;

    async fn upsert_relationship(
        &self,
        tenant_id: &str,
        document_id: &str,
        relationship: &EntityRelationship,
    ) -> Result<(), StoreError>;

    /// Delete the document's nodes not in `keep_entities` (with their edges)
    /// and its edges not in `keep_edges`.
    async fn prune_document(
        &self,
        document_id: &str,
        keep_entities: &[String],
        keep_edges: &[EdgeKey],
    ) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Identity of a graph edge: (source, target, relation type).
pub type EdgeKey = (String, String, String);

/// Vector side of the storage fan-out. Points are keyed by `point_id`, so
/// writing the same point twice overwrites it.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError>;

    async fn upsert(&self, points: &[VectorPoint]) -> Result<(), StoreError>;

    async fn delete(&self, point_ids: &[u64]) -> Result<(), StoreError>;

    /// Nearest points of one tenant, owner kind and embedding model.
    async fn search(
        &self,
        vector: &[f32],
        tenant_id: &str,
        owner_kind: OwnerKind,
        model_version: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub point_id: u64,
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub model_version: String,
    pub tenant_id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub owner_id: String,
    pub document_id: String,
    pub score: f32,
    pub text: String,
}

/// Stable numeric id for a vector point, derived from the owner and the
/// model that produced the vector.
pub fn point_id(owner_id: &str, model_version: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(model_version.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_stable_per_owner_and_model() {
        assert_eq!(point_id("chunk-1", "nomic"), point_id("chunk-1", "nomic"));
        assert_ne!(point_id("chunk-1", "nomic"), point_id("chunk-1", "nomic-v2"));
        assert_ne!(point_id("chunk-1", "nomic"), point_id("chunk-2", "nomic"));
    }
}
