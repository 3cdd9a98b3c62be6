use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::embeddings::OwnerKind;
use crate::error::StoreError;
use crate::{ScoredPoint, VectorPoint, VectorStore};

const STORE: &str = "qdrant";

/// Chunk and entity vectors share one collection, told apart by the
/// `owner_kind` payload field.
pub struct QdrantVectorStore {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Serialize)]
struct UpsertPoints<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: u64,
    vector: &'a [f32],
    payload: HashMap<&'static str, serde_json::Value>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: CollectionResult,
}

#[derive(Deserialize)]
struct CollectionResult {
    collections: Vec<Collection>,
}

#[derive(Deserialize)]
struct Collection {
    name: String,
}

#[derive(Deserialize)]
struct SearchResult {
    result: Vec<SearchPoint>,
}

#[derive(Deserialize)]
struct SearchPoint {
    score: f32,
    #[serde(default)]
    payload: HashMap<String, serde_json::Value>,
}

impl QdrantVectorStore {
    pub fn new(base_url: String, collection_name: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            client,
            collection_name,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::from_status(STORE, status, body))
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    /// Create the collection if it does not exist yet
    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError> {
        let url = format!("{}/collections", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        let info: CollectionInfo = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;

        if info
            .result
            .collections
            .iter()
            .any(|c| c.name == self.collection_name)
        {
            return Ok(());
        }

        let url = format!("{}/collections/{}", self.base_url, self.collection_name);
        let create_req = CreateCollection {
            vectors: VectorParams {
                size: dimension,
                distance: "Cosine".to_string(),
            },
        };
        let response = self
            .client
            .put(&url)
            .json(&create_req)
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        Self::check(response).await?;

        info!(
            collection = %self.collection_name,
            dimension,
            "Created Qdrant collection"
        );
        Ok(())
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let points = points
            .iter()
            .map(|p| {
                let mut payload = HashMap::new();
                payload.insert("owner_id", json!(p.owner_id));
                payload.insert("owner_kind", json!(p.owner_kind.as_str()));
                payload.insert("model_version", json!(p.model_version));
                payload.insert("tenant_id", json!(p.tenant_id));
                payload.insert("document_id", json!(p.document_id));
                payload.insert("text", json!(p.text));
                Point {
                    id: p.point_id,
                    vector: &p.vector,
                    payload,
                }
            })
            .collect();

        // wait=true so a following commit never races the index
        let url = format!(
            "{}/collections/{}/points?wait=true",
            self.base_url, self.collection_name
        );
        let response = self
            .client
            .put(&url)
            .json(&UpsertPoints { points })
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, point_ids: &[u64]) -> Result<(), StoreError> {
        if point_ids.is_empty() {
            return Ok(());
        }

        let url = format!(
            "{}/collections/{}/points/delete?wait=true",
            self.base_url, self.collection_name
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "points": point_ids }))
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        Self::check(response).await?;
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
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection_name
        );
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "filter": {
                "must": [
                    { "key": "tenant_id", "match": { "value": tenant_id } },
                    { "key": "owner_kind", "match": { "value": owner_kind.as_str() } },
                    { "key": "model_version", "match": { "value": model_version } }
                ]
            }
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        let result: SearchResult = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;

        Ok(result
            .result
            .into_iter()
            .filter_map(|point| {
                let field = |name: &str| {
                    point
                        .payload
                        .get(name)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                Some(ScoredPoint {
                    owner_id: field("owner_id")?,
                    document_id: field("document_id")?,
                    text: field("text").unwrap_or_default(),
                    score: point.score,
                })
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/collections", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::from_http(STORE, e))?;
        Self::check(response).await?;
        Ok(())
    }
}
