//! Text extraction, chunking and embedding collaborators used by the stages.

pub mod chunker;
pub mod extract;
pub mod vector;

use crate::error::{ProcessError, VectorError};

pub use chunker::{ChunkMetadata, ParagraphChunker, TextChunk};
pub use extract::{DocumentFormat, ExtractorRegistry, PAGE_BREAK};
pub use vector::{EmbedOutcome, HashingVectorIndex, SearchHit, VectorPoint};

pub trait TextExtractor: Send + Sync {
    /// Fails on unsupported formats, empty results and results above the
    /// configured size ceiling.
    fn extract(&self, bytes: &[u8], extension: &str) -> Result<String, ProcessError>;
}

pub trait Chunker: Send + Sync {
    fn chunk(&self, text: &str, metadata: &ChunkMetadata) -> Result<Vec<TextChunk>, ProcessError>;
}

pub trait VectorIndex: Send + Sync {
    fn embed_and_store(
        &self,
        chunks: &[TextChunk],
        document_id: &str,
        user_id: &str,
    ) -> Result<EmbedOutcome, VectorError>;

    /// Removes every point of a document. Returns how many were removed.
    fn delete_document(&self, document_id: &str) -> Result<usize, VectorError>;
}
