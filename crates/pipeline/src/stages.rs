use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use extract::{
    ChunkingParams, Classification, Classifier, Extraction, ExtractionSchema, Extractor,
    SchemaRegistry,
};
use index::{Embedder, Embedding, StorageBatch, StorageCoordinator, StorageSummary};
use ingest::{
    Chunker, ChunkerConfig, Document, DocumentChunk, EntitySpan, PipelineState, SourceReader,
};

use crate::error::StageError;

/// Outputs of the stages run so far for one document. Lives in memory for
/// a single processing attempt; every write downstream is idempotent, so
/// losing it only costs recomputation.
#[derive(Debug, Default, Clone)]
pub struct ProcessingContext {
    pub text: Option<String>,
    pub classification: Option<Classification>,
    pub extraction: Option<Extraction>,
    pub chunks: Option<Vec<DocumentChunk>>,
    pub embeddings: Option<Vec<Embedding>>,
}

#[derive(Debug)]
pub enum StageOutput {
    Classified {
        text: String,
        classification: Classification,
    },
    Extracted(Extraction),
    Chunked(Vec<DocumentChunk>),
    Embedded(Vec<Embedding>),
    Stored(StorageSummary),
}

impl ProcessingContext {
    pub fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Classified {
                text,
                classification,
            } => {
                self.text = Some(text);
                self.classification = Some(classification);
            }
            StageOutput::Extracted(extraction) => self.extraction = Some(extraction),
            StageOutput::Chunked(chunks) => self.chunks = Some(chunks),
            StageOutput::Embedded(embeddings) => self.embeddings = Some(embeddings),
            StageOutput::Stored(_) => {}
        }
    }
}

fn missing(what: &str) -> StageError {
    StageError::Permanent(format!("{what} is not available for this stage"))
}

/// The five pipeline stages behind one entry point. Stages never touch
/// document state; they only return outputs or classified errors.
pub struct Stages {
    classifier: Classifier,
    extractor: Extractor,
    registry: Arc<SchemaRegistry>,
    default_chunking: ChunkerConfig,
    embedder: Arc<Embedder>,
    storage: StorageCoordinator,
}

impl Stages {
    pub fn new(
        classifier: Classifier,
        extractor: Extractor,
        registry: Arc<SchemaRegistry>,
        default_chunking: ChunkerConfig,
        embedder: Arc<Embedder>,
        storage: StorageCoordinator,
    ) -> Self {
        Self {
            classifier,
            extractor,
            registry,
            default_chunking,
            embedder,
            storage,
        }
    }

    pub async fn run(
        &self,
        stage: PipelineState,
        document: &Document,
        ctx: &ProcessingContext,
    ) -> Result<StageOutput, StageError> {
        match stage {
            PipelineState::Classifying => self.classify(document).await,
            PipelineState::Extracting => self.extract(document, ctx).await,
            PipelineState::Chunking => self.chunk(document, ctx),
            PipelineState::Embedding => self.embed(document, ctx).await,
            PipelineState::Storing => self.store(document, ctx).await,
            other => Err(StageError::Permanent(format!("{other} is not a stage"))),
        }
    }

    async fn classify(&self, document: &Document) -> Result<StageOutput, StageError> {
        let text = SourceReader::read_file(Path::new(&document.source_path)).await?;
        let classification = self
            .classifier
            .classify(&document.document_id, &text, &document.source_path)
            .await;
        Ok(StageOutput::Classified {
            text,
            classification,
        })
    }

    fn schema(&self, ctx: &ProcessingContext) -> Result<&ExtractionSchema, StageError> {
        let classification = ctx
            .classification
            .as_ref()
            .ok_or_else(|| missing("classification"))?;
        self.registry.get(&classification.schema_id).ok_or_else(|| {
            StageError::Permanent(format!("unknown schema {}", classification.schema_id))
        })
    }

    async fn extract(
        &self,
        document: &Document,
        ctx: &ProcessingContext,
    ) -> Result<StageOutput, StageError> {
        let text = ctx.text.as_deref().ok_or_else(|| missing("document text"))?;
        let schema = self.schema(ctx)?;
        let extraction = self
            .extractor
            .extract(&document.document_id, text, schema)
            .await?;
        Ok(StageOutput::Extracted(extraction))
    }

    fn chunk(&self, document: &Document, ctx: &ProcessingContext) -> Result<StageOutput, StageError> {
        let text = ctx.text.as_deref().ok_or_else(|| missing("document text"))?;
        let extraction = ctx.extraction.as_ref().ok_or_else(|| missing("extraction"))?;
        let schema = self.schema(ctx)?;

        // Schemas that keep the stock parameters follow the configured default.
        let config = if schema.chunking == ChunkingParams::default() {
            self.default_chunking
        } else {
            ChunkerConfig {
                target_tokens: schema.chunking.target_tokens,
                overlap_tokens: schema.chunking.overlap_tokens,
            }
        };
        let chunker = Chunker::new(config)?;

        let spans: Vec<EntitySpan> = extraction
            .entities
            .iter()
            .flat_map(|entity| {
                entity.spans.iter().map(|&(start, end)| EntitySpan {
                    entity_id: entity.entity_id.clone(),
                    start,
                    end,
                })
            })
            .collect();

        let chunks = chunker.chunk_text(&document.document_id, text, &spans);
        debug!(
            document_id = %document.document_id,
            chunks = chunks.len(),
            target_tokens = config.target_tokens,
            "Chunked document"
        );
        Ok(StageOutput::Chunked(chunks))
    }

    async fn embed(
        &self,
        document: &Document,
        ctx: &ProcessingContext,
    ) -> Result<StageOutput, StageError> {
        let chunks = ctx.chunks.as_deref().ok_or_else(|| missing("chunks"))?;
        let extraction = ctx.extraction.as_ref().ok_or_else(|| missing("extraction"))?;
        let embeddings = self
            .embedder
            .embed_document(&document.document_id, chunks, &extraction.entities)
            .await?;
        Ok(StageOutput::Embedded(embeddings))
    }

    async fn store(
        &self,
        document: &Document,
        ctx: &ProcessingContext,
    ) -> Result<StageOutput, StageError> {
        let extraction = ctx.extraction.as_ref().ok_or_else(|| missing("extraction"))?;
        let chunks = ctx.chunks.as_deref().ok_or_else(|| missing("chunks"))?;
        let embeddings = ctx
            .embeddings
            .as_deref()
            .ok_or_else(|| missing("embeddings"))?;

        let summary = self
            .storage
            .store(StorageBatch {
                tenant_id: &document.tenant_id,
                document_id: &document.document_id,
                model_version: self.embedder.model_version(),
                entities: &extraction.entities,
                relationships: &extraction.relationships,
                chunks,
                embeddings,
            })
            .await?;
        Ok(StageOutput::Stored(summary))
    }
}
