pub mod classifier;
pub mod llm;
pub mod normalizer;
pub mod prompt;
pub mod schema;

pub use classifier::Classifier;
pub use llm::{LanguageModel, LlmError, OllamaClient};
pub use normalizer::EntityNormalizer;
pub use schema::{
    ChunkingParams, Classification, EntityRelationship, ExtractedEntity, Extraction,
    ExtractionSchema, SchemaRegistry,
};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.5;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("extraction response does not match the expected schema: {0}")]
    SchemaMismatch(String),
}

impl ExtractionError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractionError::Llm(e) => e.is_transient(),
            ExtractionError::SchemaMismatch(_) => false,
        }
    }
}

#[derive(Deserialize)]
struct RawExtraction {
    entities: Vec<RawEntity>,
    #[serde(default, alias = "relations")]
    relationships: Vec<RawRelationship>,
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(alias = "name")]
    value: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct RawRelationship {
    #[serde(alias = "source_entity")]
    source: String,
    #[serde(alias = "target_entity")]
    target: String,
    #[serde(alias = "relation", alias = "relationship_type")]
    relation_type: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Pulls schema-constrained entities and relationships out of document text.
pub struct Extractor {
    llm: Arc<dyn LanguageModel>,
    confidence_floor: f32,
    max_repairs: usize,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LanguageModel>, confidence_floor: f32) -> Self {
        Self {
            llm,
            confidence_floor,
            max_repairs: 1,
        }
    }

    pub async fn extract(
        &self,
        document_id: &str,
        text: &str,
        schema: &ExtractionSchema,
    ) -> Result<Extraction, ExtractionError> {
        if text.trim().is_empty() {
            warn!(document_id, quality_warning = true, "Document is empty, nothing to extract");
            return Ok(Extraction::default());
        }

        let prompt = prompt::build_extraction_prompt(text, schema);
        let response = self.llm.generate_json(&prompt, self.max_repairs).await?;
        let raw: RawExtraction = serde_json::from_value(response)
            .map_err(|e| ExtractionError::SchemaMismatch(e.to_string()))?;

        let floor = schema.confidence_floor.unwrap_or(self.confidence_floor);
        let extraction = self.process(document_id, text, schema, floor, raw);

        if extraction.entities.is_empty() {
            warn!(
                document_id,
                schema_id = %schema.schema_id,
                quality_warning = true,
                "No entities extracted from non-empty document"
            );
        }
        info!(
            document_id,
            entities = extraction.entities.len(),
            relationships = extraction.relationships.len(),
            "Extracted entities"
        );

        Ok(extraction)
    }

    fn process(
        &self,
        document_id: &str,
        text: &str,
        schema: &ExtractionSchema,
        floor: f32,
        raw: RawExtraction,
    ) -> Extraction {
        let mut entities: Vec<ExtractedEntity> = Vec::new();
        // (type, lowercase normalized value) -> index into `entities`
        let mut by_key: HashMap<(String, String), usize> = HashMap::new();
        // any lowercase surface or normalized form -> entity_id
        let mut by_value: HashMap<String, String> = HashMap::new();

        for candidate in raw.entities {
            let Some(entity_type) = schema.entity_type(&candidate.entity_type) else {
                continue;
            };
            let confidence = candidate.confidence.unwrap_or(1.0).clamp(0.0, 1.0);
            if confidence < floor {
                continue;
            }
            let surface = candidate.value.trim();
            let normalized = EntityNormalizer::normalize(entity_type, surface);
            if normalized.is_empty() {
                continue;
            }

            let key = (entity_type.to_string(), normalized.to_lowercase());
            let spans = find_spans(text, surface);
            let index = match by_key.get(&key).copied() {
                Some(index) => {
                    let existing = &mut entities[index];
                    existing.confidence = existing.confidence.max(confidence);
                    for span in spans {
                        if !existing.spans.contains(&span) {
                            existing.spans.push(span);
                        }
                    }
                    existing.spans.sort_unstable();
                    index
                }
                None => {
                    entities.push(ExtractedEntity {
                        entity_id: entity_id(document_id, &key.0, &key.1),
                        document_id: document_id.to_string(),
                        entity_type: key.0.clone(),
                        normalized_value: normalized.clone(),
                        confidence,
                        raw_span: surface.to_string(),
                        spans,
                    });
                    by_key.insert(key, entities.len() - 1);
                    entities.len() - 1
                }
            };
            let id = entities[index].entity_id.clone();
            by_value.entry(surface.to_lowercase()).or_insert_with(|| id.clone());
            by_value.entry(normalized.to_lowercase()).or_insert(id);
        }

        let mut relationships: Vec<EntityRelationship> = Vec::new();
        for candidate in raw.relationships {
            let Some(relation_type) = schema.relationship_type(&candidate.relation_type) else {
                continue;
            };
            let source = by_value.get(&candidate.source.trim().to_lowercase());
            let target = by_value.get(&candidate.target.trim().to_lowercase());
            let (Some(source), Some(target)) = (source, target) else {
                continue;
            };
            let confidence = candidate.confidence.unwrap_or(1.0).clamp(0.0, 1.0);

            match relationships.iter_mut().find(|r| {
                &r.source_entity_id == source
                    && &r.target_entity_id == target
                    && r.relation_type == relation_type
            }) {
                Some(existing) => existing.confidence = existing.confidence.max(confidence),
                None => relationships.push(EntityRelationship {
                    source_entity_id: source.clone(),
                    target_entity_id: target.clone(),
                    relation_type: relation_type.to_string(),
                    confidence,
                }),
            }
        }

        Extraction {
            entities,
            relationships,
        }
    }
}

/// Stable id, so re-running extraction on the same document upserts rather
/// than duplicates.
pub fn entity_id(document_id: &str, entity_type: &str, normalized_lower: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0]);
    hasher.update(entity_type.as_bytes());
    hasher.update([0]);
    hasher.update(normalized_lower.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Byte ranges of every ASCII-case-insensitive occurrence of `needle`.
fn find_spans(text: &str, needle: &str) -> Vec<(usize, usize)> {
    if needle.is_empty() {
        return Vec::new();
    }
    let haystack = text.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    haystack
        .match_indices(&needle)
        .map(|(start, m)| (start, start + m.len()))
        .collect()
}
