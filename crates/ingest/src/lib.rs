pub mod chunk;
pub mod chunker;
pub mod document;
pub mod reader;

pub use chunk::{DocumentChunk, estimate_tokens};
pub use chunker::{Chunker, ChunkerConfig, ChunkingError, EntitySpan};
pub use document::{
    DEFAULT_PRIORITY, Document, IntakeError, IntakeRequest, PipelineState, UnknownState,
    generate_doc_id,
};
pub use reader::{ReadError, SourceReader};
