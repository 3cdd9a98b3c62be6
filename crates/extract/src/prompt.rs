use crate::schema::ExtractionSchema;

/// Characters of document text shown to the classifier.
pub const CLASSIFICATION_SAMPLE_CHARS: usize = 3000;

pub fn build_classification_prompt<'a>(
    text: &str,
    source_path: &str,
    schemas: impl Iterator<Item = &'a ExtractionSchema>,
) -> String {
    let sample: String = text.chars().take(CLASSIFICATION_SAMPLE_CHARS).collect();
    let ellipsis = if text.chars().count() > CLASSIFICATION_SAMPLE_CHARS {
        "..."
    } else {
        ""
    };
    let types = schemas
        .map(|s| format!("- {}: {}", s.document_type, s.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Classify the following document into exactly one of these types:

{types}

Document source: {source_path}

Document content (sample):
{sample}{ellipsis}

Output ONLY valid JSON with this shape:
{{"type": "one_of_the_types_above", "confidence": 0.95}}

JSON OUTPUT:"#
    )
}

pub fn build_extraction_prompt(text: &str, schema: &ExtractionSchema) -> String {
    format!(
        r#"Extract entities and relationships from the following {document_type} document.

INSTRUCTIONS:
1. Extract ALL instances of the entity types listed below, and ONLY those types
2. Extract relationships between extracted entities using ONLY the relationship types listed below
3. Output ONLY valid JSON, nothing else

ENTITY TYPES: {entity_types}
RELATIONSHIP TYPES: {relationship_types}

SCHEMA:
{{
  "entities": [
    {{"type": "entity_type", "value": "exact text from the document", "confidence": 0.9}}
  ],
  "relationships": [
    {{"source": "value of source entity", "target": "value of target entity", "relation_type": "RELATIONSHIP_TYPE", "confidence": 0.8}}
  ]
}}

RULES:
- "value" must be copied verbatim from the text
- Relationship source/target must repeat an entity "value"
- Confidence is a number between 0 and 1
- Output ONLY the JSON object, no markdown, no explanations

TEXT:
{text}

JSON OUTPUT:"#,
        document_type = schema.document_type,
        entity_types = schema.entity_types.join(", "),
        relationship_types = schema.relationship_types.join(", "),
    )
}

pub fn build_retry_prompt(invalid_json: &str) -> String {
    format!(
        r#"The following JSON is invalid:

{}

Fix this JSON. Output only valid JSON with no markdown formatting, no code blocks, no explanations. Just the raw JSON object."#,
        invalid_json
    )
}
