use std::fmt;

use serde::{Deserialize, Serialize};

use crate::jobs::JobType;

/// The four document stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    ExtractText,
    ChunkText,
    EmbedChunks,
}

/// The fixed chain walked by the orchestrator.
pub const PIPELINE: [Stage; 4] = [
    Stage::Upload,
    Stage::ExtractText,
    Stage::ChunkText,
    Stage::EmbedChunks,
];

impl Stage {
    pub fn job_type(self) -> JobType {
        match self {
            Stage::Upload => JobType::UploadDocument,
            Stage::ExtractText => JobType::ExtractText,
            Stage::ChunkText => JobType::ChunkText,
            Stage::EmbedChunks => JobType::EmbedChunks,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::ExtractText => "extract_text",
            Stage::ChunkText => "chunk_text",
            Stage::EmbedChunks => "embed_chunks",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        PIPELINE.into_iter().find(|s| s.as_str() == name)
    }

    pub fn position(self) -> usize {
        PIPELINE.iter().position(|s| *s == self).unwrap_or(0)
    }

    pub fn next(self) -> Option<Stage> {
        PIPELINE.get(self.position() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
