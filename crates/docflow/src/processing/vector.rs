//! Local vector index with feature-hashed embeddings.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VectorError;

use super::{TextChunk, VectorIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub point_id: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedOutcome {
    pub added_count: usize,
    pub points: Vec<VectorPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document_id: String,
    pub chunk_index: u32,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct StoredPoint {
    point: VectorPoint,
    user_id: String,
    vector: Vec<f32>,
}

#[derive(Default)]
struct IndexState {
    documents: HashMap<String, Vec<StoredPoint>>,
    embed_calls: usize,
    failures: u32,
}

/// Deterministic bag-of-words embeddings hashed into `dimensions` buckets.
/// Re-embedding a document replaces its points.
pub struct HashingVectorIndex {
    dimensions: usize,
    state: Mutex<IndexState>,
}

impl Default for HashingVectorIndex {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn embed_calls(&self) -> usize {
        self.state.lock().map(|s| s.embed_calls).unwrap_or(0)
    }

    pub fn point_count(&self, document_id: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.documents.get(document_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// The next `times` embed calls fail with [`VectorError::Unavailable`].
    pub fn inject_failure(&self, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures = times;
        }
    }

    /// Best matches among `user_id`'s points by cosine similarity.
    pub fn search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorError> {
        let query = self.embed(query);
        let query = &query;
        let state = self.lock()?;
        let mut hits: Vec<SearchHit> = state
            .documents
            .iter()
            .flat_map(|(document_id, points)| {
                points
                    .iter()
                    .filter(move |p| p.user_id == user_id)
                    .map(move |p| SearchHit {
                        document_id: document_id.clone(),
                        chunk_index: p.point.chunk_index,
                        score: dot(query, &p.vector),
                    })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexState>, VectorError> {
        self.state
            .lock()
            .map_err(|_| VectorError::Unavailable("index lock poisoned".to_string()))
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Stable point id per (document, chunk) so re-embedding overwrites.
fn point_id(document_id: &str, chunk_index: u32) -> String {
    let digest = Sha256::digest(format!("{}:{}", document_id, chunk_index).as_bytes());
    hex::encode(&digest[..16])
}

impl VectorIndex for HashingVectorIndex {
    fn embed_and_store(
        &self,
        chunks: &[TextChunk],
        document_id: &str,
        user_id: &str,
    ) -> Result<EmbedOutcome, VectorError> {
        {
            let mut state = self.lock()?;
            state.embed_calls += 1;
            if state.failures > 0 {
                state.failures -= 1;
                return Err(VectorError::Unavailable("injected failure".to_string()));
            }
        }

        let stored: Vec<StoredPoint> = chunks
            .iter()
            .filter(|c| !c.content.trim().is_empty())
            .map(|c| StoredPoint {
                point: VectorPoint {
                    point_id: point_id(document_id, c.chunk_index),
                    chunk_index: c.chunk_index,
                },
                user_id: user_id.to_string(),
                vector: self.embed(&c.content),
            })
            .collect();
        let points: Vec<VectorPoint> = stored.iter().map(|s| s.point.clone()).collect();

        self.lock()?.documents.insert(document_id.to_string(), stored);
        Ok(EmbedOutcome {
            added_count: points.len(),
            points,
        })
    }

    fn delete_document(&self, document_id: &str) -> Result<usize, VectorError> {
        Ok(self
            .lock()?
            .documents
            .remove(document_id)
            .map_or(0, |p| p.len()))
    }
}
