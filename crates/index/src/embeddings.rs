use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use extract::ExtractedEntity;
use ingest::DocumentChunk;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service unreachable: {0}")]
    Transport(String),
    #[error("embedding request timed out")]
    Timeout,
    #[error("embedding service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding service returned an empty vector")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Transport(_) | EmbeddingError::Timeout => true,
            EmbeddingError::Status { status, .. } => *status == 429 || *status >= 500,
            EmbeddingError::Empty | EmbeddingError::DimensionMismatch { .. } => false,
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EmbeddingError::Timeout
        } else {
            EmbeddingError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Chunk,
    Entity,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Chunk => "chunk",
            OwnerKind::Entity => "entity",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One vector per owner per model version. A new model version adds rows
/// rather than replacing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub vector: Vec<f32>,
    pub model_version: String,
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn model_version(&self) -> &str;
}

#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            model,
            client,
        }
    }
}

#[async_trait]
impl EmbeddingBackend for EmbeddingClient {
    /// Generate embedding for text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);

        let request = EmbeddingRequest {
            model: self.model.clone(),
            prompt: text.to_string(),
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status { status, body });
        }

        let embedding_response: EmbeddingResponse = response.json().await?;
        Ok(embedding_response.embedding)
    }

    fn model_version(&self) -> &str {
        &self.model
    }
}

/// Embeds the chunks and entities of one document with a single model.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    dimension: Option<usize>,
}

impl Embedder {
    /// `dimension` pins the expected vector size; when `None` the first
    /// vector of each run sets it.
    pub fn new(backend: Arc<dyn EmbeddingBackend>, dimension: Option<usize>) -> Self {
        Self { backend, dimension }
    }

    pub fn model_version(&self) -> &str {
        self.backend.model_version()
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let vector = self.backend.embed(text).await?;
        let mut expected = self.dimension;
        check_dimension(&mut expected, &vector)?;
        Ok(vector)
    }

    pub async fn embed_document(
        &self,
        document_id: &str,
        chunks: &[DocumentChunk],
        entities: &[ExtractedEntity],
    ) -> Result<Vec<Embedding>, EmbeddingError> {
        let model_version = self.backend.model_version().to_string();
        let mut expected = self.dimension;
        let mut embeddings = Vec::with_capacity(chunks.len() + entities.len());

        for chunk in chunks {
            let vector = self.backend.embed(&chunk.text).await?;
            check_dimension(&mut expected, &vector)?;
            embeddings.push(Embedding {
                owner_id: chunk.chunk_id.clone(),
                owner_kind: OwnerKind::Chunk,
                vector,
                model_version: model_version.clone(),
            });
        }
        for entity in entities {
            let vector = self.backend.embed(&entity_text(entity)).await?;
            check_dimension(&mut expected, &vector)?;
            embeddings.push(Embedding {
                owner_id: entity.entity_id.clone(),
                owner_kind: OwnerKind::Entity,
                vector,
                model_version: model_version.clone(),
            });
        }

        info!(
            document_id,
            embeddings = embeddings.len(),
            model = %model_version,
            "Generated embeddings"
        );
        Ok(embeddings)
    }
}

/// Text embedded for an entity and stored alongside its vector.
pub fn entity_text(entity: &ExtractedEntity) -> String {
    format!("{}: {}", entity.entity_type, entity.normalized_value)
}

fn check_dimension(expected: &mut Option<usize>, vector: &[f32]) -> Result<(), EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::Empty);
    }
    match *expected {
        Some(dim) if dim != vector.len() => Err(EmbeddingError::DimensionMismatch {
            expected: dim,
            actual: vector.len(),
        }),
        Some(_) => Ok(()),
        None => {
            *expected = Some(vector.len());
            Ok(())
        }
    }
}
