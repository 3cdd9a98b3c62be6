use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub token_count: usize,
    /// Entities overlapping this chunk, in first-seen order.
    pub entity_ids: Vec<String>,
    pub start: usize, // byte offsets into the source text
    pub end: usize,
}

impl DocumentChunk {
    pub fn new(
        document_id: &str,
        sequence_index: usize,
        text: &str,
        offset: (usize, usize),
        entity_ids: Vec<String>,
    ) -> Self {
        // Generate stable chunk_id from content
        let chunk_id = Self::generate_chunk_id(document_id, text, offset);

        Self {
            chunk_id,
            document_id: document_id.to_string(),
            sequence_index,
            text: text.to_string(),
            token_count: estimate_tokens(text),
            entity_ids,
            start: offset.0,
            end: offset.1,
        }
    }

    fn generate_chunk_id(document_id: &str, text: &str, offset: (usize, usize)) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(offset.0.to_string().as_bytes());
        hasher.update(offset.1.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }
}

/// Estimate token count (rough: 1.3 tokens per word)
pub fn estimate_tokens(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f64 * 1.3) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_depends_on_offsets() {
        let a = DocumentChunk::new("doc", 0, "same text", (0, 9), vec![]);
        let b = DocumentChunk::new("doc", 1, "same text", (20, 29), vec![]);
        assert_ne!(a.chunk_id, b.chunk_id);
        assert_eq!(a.chunk_id.len(), 32);
    }

    #[test]
    fn token_estimate_scales_with_words() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two three four five six seven eight nine ten"), 13);
    }
}
