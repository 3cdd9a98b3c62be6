use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use extract::{EntityRelationship, ExtractedEntity};

use crate::embeddings::OwnerKind;
use crate::error::StoreError;
use crate::{EdgeKey, GraphStore, ScoredPoint, VectorPoint, VectorStore};

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub tenant_id: String,
    pub entity: ExtractedEntity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub tenant_id: String,
    pub document_id: String,
    pub confidence: f32,
}

/// In-process graph store with the same merge semantics as the Neo4j one.
/// Used for local runs and tests.
#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: DashMap<String, GraphNode>,
    edges: DashMap<EdgeKey, GraphEdge>,
    unavailable: AtomicBool,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, entity_id: &str) -> Option<GraphNode> {
        self.nodes.get(entity_id).map(|n| n.value().clone())
    }

    /// Make every call fail as if the server were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: "memory-graph",
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_entity(
        &self,
        tenant_id: &str,
        entity: &ExtractedEntity,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.nodes.insert(
            entity.entity_id.clone(),
            GraphNode {
                tenant_id: tenant_id.to_string(),
                entity: entity.clone(),
            },
        );
        Ok(())
    }

    async fn upsert_relationship(
        &self,
        tenant_id: &str,
        document_id: &str,
        relationship: &EntityRelationship,
    ) -> Result<(), StoreError> {
        self.check()?;
        let key = (
            relationship.source_entity_id.clone(),
            relationship.target_entity_id.clone(),
            relationship.relation_type.clone(),
        );
        self.edges.insert(
            key,
            GraphEdge {
                tenant_id: tenant_id.to_string(),
                document_id: document_id.to_string(),
                confidence: relationship.confidence,
            },
        );
        Ok(())
    }

    async fn prune_document(
        &self,
        document_id: &str,
        keep_entities: &[String],
        keep_edges: &[EdgeKey],
    ) -> Result<(), StoreError> {
        self.check()?;
        self.nodes
            .retain(|id, node| node.entity.document_id != document_id || keep_entities.contains(id));
        self.edges.retain(|key, edge| {
            let attached = self.nodes.contains_key(&key.0) && self.nodes.contains_key(&key.1);
            attached && (edge.document_id != document_id || keep_edges.contains(key))
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

/// In-process vector store with brute-force cosine search.
#[derive(Default)]
pub struct MemoryVectorStore {
    points: DashMap<u64, VectorPoint>,
    unavailable: AtomicBool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, point_id: u64) -> bool {
        self.points.contains_key(&point_id)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: "memory-vector",
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, _dimension: usize) -> Result<(), StoreError> {
        self.check()
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<(), StoreError> {
        self.check()?;
        for point in points {
            self.points.insert(point.point_id, point.clone());
        }
        Ok(())
    }

    async fn delete(&self, point_ids: &[u64]) -> Result<(), StoreError> {
        self.check()?;
        for id in point_ids {
            self.points.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        tenant_id: &str,
        owner_kind: OwnerKind,
        model_version: &str,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        self.check()?;
        let mut scored: Vec<ScoredPoint> = self
            .points
            .iter()
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.owner_kind == owner_kind
                    && p.model_version == model_version
            })
            .map(|p| ScoredPoint {
                owner_id: p.owner_id.clone(),
                document_id: p.document_id.clone(),
                score: cosine_similarity(vector, &p.vector),
                text: p.text.clone(),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.owner_id.cmp(&b.owner_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: u64, tenant: &str, kind: OwnerKind, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            point_id: id,
            owner_id: format!("owner-{id}"),
            owner_kind: kind,
            model_version: "m1".into(),
            tenant_id: tenant.into(),
            document_id: "doc-1".into(),
            vector,
            text: String::new(),
        }
    }

    #[tokio::test]
    async fn search_filters_by_tenant_kind_and_model() {
        let store = MemoryVectorStore::new();
        store
            .upsert(&[
                point(1, "a", OwnerKind::Chunk, vec![1.0, 0.0]),
                point(2, "a", OwnerKind::Chunk, vec![0.0, 1.0]),
                point(3, "b", OwnerKind::Chunk, vec![1.0, 0.0]),
                point(4, "a", OwnerKind::Entity, vec![1.0, 0.0]),
                VectorPoint {
                    model_version: "m2".into(),
                    ..point(5, "a", OwnerKind::Chunk, vec![1.0, 0.0])
                },
            ])
            .await
            .unwrap();

        let hits = store
            .search(&[1.0, 0.1], "a", OwnerKind::Chunk, "m1", 10)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.owner_id.as_str()).collect();
        assert_eq!(ids, vec!["owner-1", "owner-2"]);

        let hits = store
            .search(&[1.0, 0.1], "a", OwnerKind::Chunk, "m2", 10)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.owner_id.as_str()).collect();
        assert_eq!(ids, vec!["owner-5"]);

        store.delete(&[1, 99]).await.unwrap();
        assert!(!store.contains(1));
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn prune_drops_stale_nodes_and_their_edges() {
        let graph = MemoryGraphStore::new();
        let entity = |id: &str, doc: &str| ExtractedEntity {
            entity_id: id.into(),
            document_id: doc.into(),
            entity_type: "person".into(),
            normalized_value: id.into(),
            confidence: 0.9,
            raw_span: id.into(),
            spans: vec![],
        };
        let knows = |source: &str, target: &str| EntityRelationship {
            source_entity_id: source.into(),
            target_entity_id: target.into(),
            relation_type: "knows".into(),
            confidence: 0.8,
        };
        for e in [entity("a", "doc-1"), entity("b", "doc-1"), entity("c", "doc-1"), entity("x", "doc-2")] {
            graph.upsert_entity("t", &e).await.unwrap();
        }
        graph.upsert_relationship("t", "doc-1", &knows("a", "b")).await.unwrap();
        graph.upsert_relationship("t", "doc-1", &knows("a", "c")).await.unwrap();
        graph.upsert_relationship("t", "doc-1", &knows("b", "a")).await.unwrap();

        let keep_edges = vec![("a".to_string(), "b".to_string(), "knows".to_string())];
        graph
            .prune_document("doc-1", &["a".into(), "b".into()], &keep_edges)
            .await
            .unwrap();

        assert!(graph.node("c").is_none());
        assert!(graph.node("x").is_some());
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn repeated_upserts_do_not_duplicate() {
        let graph = MemoryGraphStore::new();
        let entity = ExtractedEntity {
            entity_id: "e1".into(),
            document_id: "doc-1".into(),
            entity_type: "person".into(),
            normalized_value: "Alice".into(),
            confidence: 0.9,
            raw_span: "Alice".into(),
            spans: vec![],
        };
        graph.upsert_entity("t", &entity).await.unwrap();
        graph.upsert_entity("t", &entity).await.unwrap();
        assert_eq!(graph.node_count(), 1);

        graph.set_unavailable(true);
        assert!(graph.ping().await.unwrap_err().is_transient());
    }
}
