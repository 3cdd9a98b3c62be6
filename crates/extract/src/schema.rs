use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GENERIC_TYPE: &str = "generic";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            target_tokens: 1000,
            overlap_tokens: 200,
        }
    }
}

/// Which entity and relationship types apply to one document type.
/// Selected by the classifier and passed to the extractor as plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub schema_id: String,
    pub document_type: String,
    pub version: u32,
    pub description: String,
    pub entity_types: Vec<String>,
    pub relationship_types: Vec<String>,
    /// Overrides the extractor's default confidence floor when set.
    pub confidence_floor: Option<f32>,
    pub chunking: ChunkingParams,
}

impl ExtractionSchema {
    pub fn new(
        document_type: &str,
        version: u32,
        description: &str,
        entity_types: &[&str],
        relationship_types: &[&str],
    ) -> Self {
        Self {
            schema_id: format!("{document_type}@{version}"),
            document_type: document_type.to_string(),
            version,
            description: description.to_string(),
            entity_types: entity_types.iter().map(|t| t.to_string()).collect(),
            relationship_types: relationship_types.iter().map(|t| t.to_string()).collect(),
            confidence_floor: None,
            chunking: ChunkingParams::default(),
        }
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = Some(floor);
        self
    }

    pub fn with_chunking(mut self, target_tokens: usize, overlap_tokens: usize) -> Self {
        self.chunking = ChunkingParams {
            target_tokens,
            overlap_tokens,
        };
        self
    }

    /// Schema spelling of an entity type, matched case-insensitively.
    pub fn entity_type(&self, candidate: &str) -> Option<&str> {
        self.entity_types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(candidate.trim()))
            .map(String::as_str)
    }

    pub fn relationship_type(&self, candidate: &str) -> Option<&str> {
        self.relationship_types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(candidate.trim()))
            .map(String::as_str)
    }
}

/// Closed set of document types the classifier may choose from.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    by_type: BTreeMap<String, ExtractionSchema>,
}

impl SchemaRegistry {
    pub fn new(schemas: Vec<ExtractionSchema>) -> Self {
        let mut by_type: BTreeMap<String, ExtractionSchema> = schemas
            .into_iter()
            .map(|s| (s.document_type.clone(), s))
            .collect();
        by_type
            .entry(GENERIC_TYPE.to_string())
            .or_insert_with(generic_schema);
        Self { by_type }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            generic_schema(),
            ExtractionSchema::new(
                "contract",
                1,
                "Legal agreements between parties",
                &[
                    "party",
                    "person",
                    "organization",
                    "jurisdiction",
                    "term",
                    "obligation",
                    "date",
                    "monetary_amount",
                ],
                &[
                    "PARTY_TO",
                    "GOVERNED_BY",
                    "CONTAINS_OBLIGATION",
                    "EXPIRES_ON",
                    "RELATED_TO",
                ],
            )
            .with_chunking(800, 150),
            ExtractionSchema::new(
                "invoice",
                1,
                "Bills for products or services",
                &[
                    "vendor",
                    "customer",
                    "line_item",
                    "product",
                    "service",
                    "date",
                    "monetary_amount",
                ],
                &["BILLED_TO", "PROVIDED_BY", "CONTAINS", "RELATED_TO"],
            )
            .with_chunking(500, 50),
            ExtractionSchema::new(
                "technical_doc",
                1,
                "Specifications, manuals and design documents",
                &[
                    "component",
                    "system",
                    "requirement",
                    "procedure",
                    "concept",
                    "version",
                    "person",
                    "organization",
                ],
                &[
                    "DESCRIBES",
                    "DEPENDS_ON",
                    "IMPLEMENTS",
                    "PREREQUISITE_OF",
                    "RELATED_TO",
                ],
            ),
        ])
    }

    pub fn get(&self, schema_id: &str) -> Option<&ExtractionSchema> {
        self.by_type.values().find(|s| s.schema_id == schema_id)
    }

    pub fn for_type(&self, document_type: &str) -> Option<&ExtractionSchema> {
        self.by_type.get(document_type)
    }

    pub fn generic(&self) -> &ExtractionSchema {
        // present by construction
        &self.by_type[GENERIC_TYPE]
    }

    pub fn schemas(&self) -> impl Iterator<Item = &ExtractionSchema> {
        self.by_type.values()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn generic_schema() -> ExtractionSchema {
    ExtractionSchema::new(
        GENERIC_TYPE,
        1,
        "Any document that matches no specific type",
        &["term", "date", "person", "organization", "location", "amount"],
        &["MENTIONS", "REFERENCES", "RELATED_TO"],
    )
}

/// Outcome of classifying one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub document_type: String,
    pub schema_id: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub entity_id: String,
    pub document_id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub normalized_value: String,
    pub confidence: f32,
    /// Surface text as it appeared in the document.
    pub raw_span: String,
    /// Byte ranges of every occurrence of the surface text.
    pub spans: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relation_type: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<EntityRelationship>,
}
