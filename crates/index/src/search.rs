use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::embeddings::{Embedder, EmbeddingError, OwnerKind};
use crate::error::StoreError;
use crate::metadata::SqliteMetadataStore;
use crate::VectorStore;

pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);
const MAX_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("invalid search request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub tenant_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_entities: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySummary {
    pub entity_id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<EntitySummary>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

/// Vector search over chunks, filtered against the relational store so
/// only committed chunks of completed documents are returned.
pub struct SearchService {
    metadata: Arc<SqliteMetadataStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<Embedder>,
    deadline: Duration,
}

impl SearchService {
    pub fn new(
        metadata: Arc<SqliteMetadataStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<Embedder>,
    ) -> Self {
        Self {
            metadata,
            vectors,
            embedder,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        if request.query.trim().is_empty() {
            return Err(SearchError::InvalidRequest("query is empty".into()));
        }
        if request.tenant_id.trim().is_empty() {
            return Err(SearchError::InvalidRequest("tenant_id is empty".into()));
        }

        tokio::time::timeout(self.deadline, self.run(request))
            .await
            .map_err(|_| SearchError::DeadlineExceeded(self.deadline))?
    }

    async fn run(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let limit = request.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let vector = self.embedder.embed_query(&request.query).await?;

        // Over-fetch: uncommitted and foreign points are dropped below.
        let fetch = (limit * 4).max(20);
        let candidates = self
            .vectors
            .search(
                &vector,
                &request.tenant_id,
                OwnerKind::Chunk,
                self.embedder.model_version(),
                fetch,
            )
            .await?;

        let ids: Vec<String> = candidates.iter().map(|c| c.owner_id.clone()).collect();
        let visible: HashMap<String, Vec<String>> = self
            .metadata
            .visible_chunks(&request.tenant_id, &ids)
            .await?
            .into_iter()
            .map(|c| (c.chunk_id, c.entity_ids))
            .collect();

        let mut results: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|c| visible.contains_key(&c.owner_id))
            .take(limit)
            .map(|c| SearchHit {
                chunk_id: c.owner_id,
                document_id: c.document_id,
                text: c.text,
                score: c.score,
                entities: None,
            })
            .collect();

        if request.include_entities {
            let wanted: BTreeSet<String> = results
                .iter()
                .filter_map(|hit| visible.get(&hit.chunk_id))
                .flatten()
                .cloned()
                .collect();
            let wanted: Vec<String> = wanted.into_iter().collect();
            let entities: HashMap<String, EntitySummary> = self
                .metadata
                .entities_by_id(&wanted)
                .await?
                .into_iter()
                .map(|e| {
                    (
                        e.entity_id.clone(),
                        EntitySummary {
                            entity_id: e.entity_id,
                            entity_type: e.entity_type,
                            value: e.normalized_value,
                        },
                    )
                })
                .collect();

            for hit in &mut results {
                let linked = visible
                    .get(&hit.chunk_id)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| entities.get(id).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                hit.entities = Some(linked);
            }
        }

        debug!(
            tenant_id = %request.tenant_id,
            results = results.len(),
            "Search completed"
        );
        Ok(SearchResponse { results })
    }
}
