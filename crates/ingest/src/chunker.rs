use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::DocumentChunk;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 1000,
            overlap_tokens: 200,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ChunkingError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("overlap of {overlap} tokens must be smaller than the {target} token budget")]
    OverlapTooLarge { overlap: usize, target: usize },
}

/// Byte range of one occurrence of an entity in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpan {
    pub entity_id: String,
    pub start: usize,
    pub end: usize,
}

/// Splits text on sentence and paragraph boundaries without cutting through
/// entity spans. Output depends only on the input text, spans and config.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkingError> {
        if config.target_tokens == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if config.overlap_tokens >= config.target_tokens {
            return Err(ChunkingError::OverlapTooLarge {
                overlap: config.overlap_tokens,
                target: config.target_tokens,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    pub fn chunk_text(
        &self,
        document_id: &str,
        text: &str,
        spans: &[EntitySpan],
    ) -> Vec<DocumentChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut spans: Vec<&EntitySpan> = spans.iter().filter(|s| s.end > s.start).collect();
        spans.sort_by(|a, b| {
            (a.start, a.end, a.entity_id.as_str()).cmp(&(b.start, b.end, b.entity_id.as_str()))
        });

        // bounds[i] is the byte offset where sentence i starts; the last entry is text.len()
        let mut bounds: Vec<usize> = text
            .split_sentence_bound_indices()
            .map(|(idx, _)| idx)
            .collect();
        bounds.push(text.len());

        // words[i] = number of words in sentences before i
        let mut words = Vec::with_capacity(bounds.len());
        words.push(0usize);
        for pair in bounds.windows(2) {
            let count = text[pair[0]..pair[1]].split_whitespace().count();
            words.push(words[words.len() - 1] + count);
        }

        let last = bounds.len() - 1;
        let tokens = |from: usize, to: usize| ((words[to] - words[from]) as f64 * 1.3) as usize;
        let inside_span = |pos: usize| spans.iter().any(|s| s.start < pos && pos < s.end);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut prev_end = 0;

        loop {
            let mut end = (start + 1).max(prev_end + 1).min(last);
            while end < last && tokens(start, end + 1) <= self.config.target_tokens {
                end += 1;
            }
            // never cut an entity: push the boundary past the span
            while end < last && inside_span(bounds[end]) {
                end += 1;
            }

            let (from, to) = (bounds[start], bounds[end]);
            let slice = &text[from..to];
            if !slice.trim().is_empty() {
                let entity_ids = entities_within(&spans, from, to);
                chunks.push(DocumentChunk::new(
                    document_id,
                    chunks.len(),
                    slice,
                    (from, to),
                    entity_ids,
                ));
            }

            if end == last {
                break;
            }

            let mut next = end;
            if self.config.overlap_tokens > 0 {
                while next - 1 > start && tokens(next - 1, end) <= self.config.overlap_tokens {
                    next -= 1;
                }
                while next < end && inside_span(bounds[next]) {
                    next += 1;
                }
            }
            prev_end = end;
            start = next;
        }

        chunks
    }
}

fn entities_within(spans: &[&EntitySpan], from: usize, to: usize) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for span in spans {
        if span.start < to && span.end > from && !ids.contains(&span.entity_id) {
            ids.push(span.entity_id.clone());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunker() -> Chunker {
        Chunker::new(ChunkerConfig {
            target_tokens: 25,
            overlap_tokens: 10,
        })
        .unwrap()
    }

    fn long_text() -> String {
        let mut text = String::new();
        for i in 0..12 {
            text.push_str(&format!("Sentence number {i} talks about the weather today. "));
            if i % 4 == 3 {
                text.push_str("\n\n");
            }
        }
        text.push_str("Dr. Alice Smith signed the report.");
        text
    }

    #[test]
    fn test_basic_chunking() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        let text = "This is a test paragraph.\n\nThis is another paragraph.";
        let chunks = chunker.chunk_text("test-doc", text, &[]);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].document_id, "test-doc");
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let chunker = Chunker::new(ChunkerConfig::default()).unwrap();
        assert!(chunker.chunk_text("doc", "", &[]).is_empty());
        assert!(chunker.chunk_text("doc", "  \n\n ", &[]).is_empty());
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = long_text();
        let spans = vec![EntitySpan {
            entity_id: "e1".into(),
            start: text.find("Dr. Alice").unwrap(),
            end: text.find("Dr. Alice").unwrap() + "Dr. Alice Smith".len(),
        }];
        let first = small_chunker().chunk_text("doc", &text, &spans);
        let second = small_chunker().chunk_text("doc", &text, &spans);
        assert!(first.len() > 1);
        assert_eq!(first, second);
    }

    #[test]
    fn chunks_never_cut_entity_spans() {
        let text = long_text();
        let start = text.find("Dr. Alice").unwrap();
        let span = EntitySpan {
            entity_id: "alice".into(),
            start,
            end: start + "Dr. Alice Smith".len(),
        };
        let chunks = small_chunker().chunk_text("doc", &text, std::slice::from_ref(&span));

        for chunk in &chunks {
            assert!(!(span.start < chunk.start && chunk.start < span.end));
            assert!(!(span.start < chunk.end && chunk.end < span.end));
        }
        let holder = chunks
            .iter()
            .find(|c| c.entity_ids.contains(&"alice".to_string()))
            .unwrap();
        assert!(holder.text.contains("Dr. Alice Smith"));
    }

    #[test]
    fn consecutive_chunks_overlap_and_stay_ordered() {
        let text = long_text();
        let chunks = small_chunker().chunk_text("doc", &text, &[]);
        for (i, pair) in chunks.windows(2).enumerate() {
            assert_eq!(pair[0].sequence_index, i);
            assert!(pair[1].start < pair[0].end);
            assert!(pair[1].end > pair[0].end);
        }
        assert_eq!(chunks.last().unwrap().end, text.len());
    }

    #[test]
    fn oversized_sentence_becomes_its_own_chunk() {
        let chunker = Chunker::new(ChunkerConfig {
            target_tokens: 3,
            overlap_tokens: 0,
        })
        .unwrap();
        let text = "one two three four five six. seven.";
        let chunks = chunker.chunk_text("doc", text, &[]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "one two three four five six. ");
    }

    #[test]
    fn rejects_overlap_not_below_budget() {
        let err = Chunker::new(ChunkerConfig {
            target_tokens: 10,
            overlap_tokens: 10,
        })
        .err()
        .unwrap();
        assert_eq!(
            err,
            ChunkingError::OverlapTooLarge {
                overlap: 10,
                target: 10
            }
        );
    }
}
