use async_trait::async_trait;
use neo4rs::{Graph, Query};
use tracing::info;

use extract::{EntityRelationship, ExtractedEntity};

use crate::error::StoreError;
use crate::{EdgeKey, GraphStore};

const STORE: &str = "neo4j";

pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, StoreError> {
        let graph = Graph::new(uri, user, password).await.map_err(unavailable)?;
        Ok(Self { graph })
    }

    /// Initialize schema: create indexes
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        // Create index on Entity.id
        let query = Query::new(
            "CREATE INDEX entity_id_index IF NOT EXISTS FOR (e:Entity) ON (e.id)".to_string(),
        );
        self.graph.run(query).await.map_err(unavailable)?;

        // Tenant-scoped lookups
        let query = Query::new(
            "CREATE INDEX entity_tenant_index IF NOT EXISTS FOR (e:Entity) ON (e.tenant_id)"
                .to_string(),
        );
        self.graph.run(query).await.map_err(unavailable)?;

        let query = Query::new(
            "CREATE INDEX entity_document_index IF NOT EXISTS FOR (e:Entity) ON (e.document_id)"
                .to_string(),
        );
        self.graph.run(query).await.map_err(unavailable)?;

        info!("Neo4j indexes created");
        Ok(())
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    /// MERGE on the entity id so a re-run rewrites the node in place
    async fn upsert_entity(
        &self,
        tenant_id: &str,
        entity: &ExtractedEntity,
    ) -> Result<(), StoreError> {
        let query = Query::new(
            r#"
            MERGE (e:Entity {id: $id})
            SET e.tenant_id = $tenant_id,
                e.document_id = $document_id,
                e.type = $type,
                e.value = $value,
                e.confidence = $confidence
            "#
            .to_string(),
        )
        .param("id", entity.entity_id.clone())
        .param("tenant_id", tenant_id.to_string())
        .param("document_id", entity.document_id.clone())
        .param("type", entity.entity_type.clone())
        .param("value", entity.normalized_value.clone())
        .param("confidence", f64::from(entity.confidence));

        self.graph.run(query).await.map_err(unavailable)
    }

    async fn upsert_relationship(
        &self,
        tenant_id: &str,
        document_id: &str,
        relationship: &EntityRelationship,
    ) -> Result<(), StoreError> {
        // Endpoints are written first by the builder; MERGE keeps the edge unique
        // per (source, target, type).
        let query = Query::new(
            r#"
            MATCH (source:Entity {id: $source_id})
            MATCH (target:Entity {id: $target_id})
            MERGE (source)-[r:RELATION {type: $relation_type}]->(target)
            SET r.confidence = $confidence,
                r.tenant_id = $tenant_id,
                r.document_id = $document_id
            "#
            .to_string(),
        )
        .param("source_id", relationship.source_entity_id.clone())
        .param("target_id", relationship.target_entity_id.clone())
        .param("relation_type", relationship.relation_type.clone())
        .param("confidence", f64::from(relationship.confidence))
        .param("tenant_id", tenant_id.to_string())
        .param("document_id", document_id.to_string());

        self.graph.run(query).await.map_err(unavailable)
    }

    async fn prune_document(
        &self,
        document_id: &str,
        keep_entities: &[String],
        keep_edges: &[EdgeKey],
    ) -> Result<(), StoreError> {
        let nodes = Query::new(
            r#"
            MATCH (e:Entity {document_id: $document_id})
            WHERE NOT e.id IN $keep
            DETACH DELETE e
            "#
            .to_string(),
        )
        .param("document_id", document_id.to_string())
        .param("keep", keep_entities.to_vec());
        self.graph.run(nodes).await.map_err(unavailable)?;

        let keep: Vec<String> = keep_edges
            .iter()
            .map(|(source, target, kind)| edge_key(source, target, kind))
            .collect();
        let edges = Query::new(
            r#"
            MATCH (source:Entity)-[r:RELATION {document_id: $document_id}]->(target:Entity)
            WHERE NOT (source.id + '|' + target.id + '|' + r.type) IN $keep
            DELETE r
            "#
            .to_string(),
        )
        .param("document_id", document_id.to_string())
        .param("keep", keep);
        self.graph.run(edges).await.map_err(unavailable)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.graph
            .run(Query::new("RETURN 1".to_string()))
            .await
            .map_err(unavailable)
    }
}

fn edge_key(source: &str, target: &str, kind: &str) -> String {
    format!("{source}|{target}|{kind}")
}

/// Driver errors are connection or server side; treat them as retryable.
fn unavailable(e: neo4rs::Error) -> StoreError {
    StoreError::Unavailable {
        store: STORE,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_key_matches_cypher_concatenation() {
        assert_eq!(edge_key("e-a", "e-b", "knows"), "e-a|e-b|knows");
    }
}
