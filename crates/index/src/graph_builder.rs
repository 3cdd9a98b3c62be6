use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use extract::{EntityRelationship, ExtractedEntity};

use crate::error::StoreError;
use crate::{EdgeKey, GraphStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphWriteSummary {
    pub nodes: usize,
    pub edges: usize,
    pub skipped_edges: usize,
}

/// Sole writer of graph nodes and edges.
pub struct GraphBuilder {
    store: Arc<dyn GraphStore>,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Upsert all nodes, then the edges between them. Edges whose endpoints
    /// are not among `entities` are skipped so no placeholder nodes appear.
    pub async fn write(
        &self,
        tenant_id: &str,
        document_id: &str,
        entities: &[ExtractedEntity],
        relationships: &[EntityRelationship],
    ) -> Result<GraphWriteSummary, StoreError> {
        let mut summary = GraphWriteSummary::default();

        for entity in entities {
            self.store.upsert_entity(tenant_id, entity).await?;
            summary.nodes += 1;
        }

        let known: HashSet<&str> = entities.iter().map(|e| e.entity_id.as_str()).collect();
        for relationship in relationships {
            if !known.contains(relationship.source_entity_id.as_str())
                || !known.contains(relationship.target_entity_id.as_str())
            {
                warn!(
                    document_id,
                    source = %relationship.source_entity_id,
                    target = %relationship.target_entity_id,
                    "Skipping relationship with unknown endpoint"
                );
                summary.skipped_edges += 1;
                continue;
            }
            self.store
                .upsert_relationship(tenant_id, document_id, relationship)
                .await?;
            summary.edges += 1;
        }

        debug!(
            document_id,
            nodes = summary.nodes,
            edges = summary.edges,
            "Wrote graph"
        );
        Ok(summary)
    }

    /// Remove what an earlier run of the document wrote and this run did not.
    pub async fn prune(
        &self,
        document_id: &str,
        entities: &[ExtractedEntity],
        relationships: &[EntityRelationship],
    ) -> Result<(), StoreError> {
        let keep_entities: Vec<String> = entities.iter().map(|e| e.entity_id.clone()).collect();
        let keep_edges: Vec<EdgeKey> = relationships
            .iter()
            .filter(|r| {
                keep_entities.contains(&r.source_entity_id)
                    && keep_entities.contains(&r.target_entity_id)
            })
            .map(|r| {
                (
                    r.source_entity_id.clone(),
                    r.target_entity_id.clone(),
                    r.relation_type.clone(),
                )
            })
            .collect();
        self.store
            .prune_document(document_id, &keep_entities, &keep_edges)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraphStore;

    fn entity(id: &str) -> ExtractedEntity {
        ExtractedEntity {
            entity_id: id.into(),
            document_id: "doc-1".into(),
            entity_type: "person".into(),
            normalized_value: id.into(),
            confidence: 0.8,
            raw_span: id.into(),
            spans: vec![],
        }
    }

    fn rel(source: &str, target: &str) -> EntityRelationship {
        EntityRelationship {
            source_entity_id: source.into(),
            target_entity_id: target.into(),
            relation_type: "knows".into(),
            confidence: 0.7,
        }
    }

    #[tokio::test]
    async fn rerun_is_idempotent_and_dangling_edges_skipped() {
        let store = Arc::new(MemoryGraphStore::new());
        let builder = GraphBuilder::new(store.clone());
        let entities = vec![entity("a"), entity("b")];
        let relationships = vec![rel("a", "b"), rel("a", "ghost")];

        let first = builder
            .write("t", "doc-1", &entities, &relationships)
            .await
            .unwrap();
        builder
            .write("t", "doc-1", &entities, &relationships)
            .await
            .unwrap();

        assert_eq!(first.nodes, 2);
        assert_eq!(first.edges, 1);
        assert_eq!(first.skipped_edges, 1);
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_only_the_latest_run() {
        let store = Arc::new(MemoryGraphStore::new());
        let builder = GraphBuilder::new(store.clone());
        builder
            .write("t", "doc-1", &[entity("a"), entity("b")], &[rel("a", "b")])
            .await
            .unwrap();

        let rerun = vec![entity("a"), entity("c")];
        let relationships = vec![rel("a", "c")];
        builder.write("t", "doc-1", &rerun, &relationships).await.unwrap();
        builder.prune("doc-1", &rerun, &relationships).await.unwrap();

        assert!(store.node("b").is_none());
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.edge_count(), 1);
    }
}
