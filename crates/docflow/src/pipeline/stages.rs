//! Side-effecting work of each stage. Bookkeeping lives in the executor.

use std::io::Read;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::chunk_repo::{self, ChunkRow};
use crate::db::format_timestamp;
use crate::documents::{Document, NewDocument, StorageStatus};
use crate::jobs::JobType;
use crate::processing::{ChunkMetadata, TextChunk, PAGE_BREAK};
use crate::storage::{sha256_hex, ObjectMetadata};

use super::context::ChainContext;
use super::error::StageError;
use super::executor::StageDeps;

/// File details submitted with an upload; the bytes wait in staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSpec {
    pub filename: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Soft deadline checked between the steps of a stage.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn check(&self) -> Result<(), StageError> {
        if self.started.elapsed() > self.limit {
            return Err(StageError::DeadlineExceeded(self.limit));
        }
        Ok(())
    }
}

/// Resolves the document an upload writes to: the row from an earlier
/// attempt, a live duplicate with the same checksum, or a new UPLOADING row.
pub(crate) fn prepare_upload(
    deps: &StageDeps,
    ctx: &ChainContext,
    spec: Option<&UploadSpec>,
) -> Result<String, StageError> {
    if let Some(doc) = deps.documents.get_by_id(&ctx.document_id)? {
        return Ok(doc.id);
    }

    let spec = spec.ok_or_else(|| {
        StageError::Validation("upload task carries no file details".to_string())
    })?;
    let bytes = deps.staging.read(&ctx.document_id)?;
    let checksum = sha256_hex(&bytes);

    if let Some(existing) = deps
        .documents
        .get_by_checksum_and_user(&checksum, &ctx.user_id)?
    {
        info!(duplicate_of = %existing.id, "Duplicate upload detected by checksum");
        if existing.storage_status == StorageStatus::Active {
            repair_missing_object(deps, &existing, &bytes)?;
        }
        return Ok(existing.id);
    }

    let mime_type = spec.mime_type.clone().or_else(|| {
        mime_guess::from_path(&spec.filename)
            .first()
            .map(|m| m.essence_str().to_string())
    });
    let doc = deps.documents.create(&NewDocument {
        id: ctx.document_id.clone(),
        user_id: ctx.user_id.clone(),
        filename: spec.filename.clone(),
        checksum,
        size_bytes: bytes.len() as u64,
        mime_type,
    })?;
    Ok(doc.id)
}

/// An ACTIVE duplicate whose object has no live version is rewritten under
/// its existing key.
fn repair_missing_object(
    deps: &StageDeps,
    doc: &Document,
    bytes: &[u8],
) -> Result<(), StageError> {
    let key = doc.object_key();
    let live = deps
        .objects
        .latest_version(&key)?
        .is_some_and(|v| !v.is_delete_marker);
    if live {
        return Ok(());
    }

    warn!(document_id = %doc.id, storage_key = %key, "Duplicate's object is missing, re-uploading");
    let receipt = deps.objects.upload(
        &key,
        bytes,
        &content_type(doc),
        &object_metadata(doc),
    )?;
    deps.documents.mark_active(&doc.id, &key, &receipt.version_id)?;
    Ok(())
}

/// Writes the object, then records it in the document row. A retry after a
/// failed row update finds the same content already stored and skips the write.
pub(crate) fn upload(
    deps: &StageDeps,
    ctx: &ChainContext,
    document_id: &str,
    deadline: &Deadline,
) -> Result<Value, StageError> {
    let doc = deps
        .documents
        .get_by_id(document_id)?
        .ok_or_else(|| StageError::not_found("document", document_id))?;
    if doc.is_deleted {
        return Err(StageError::BusinessRule(format!(
            "document '{}' was deleted",
            doc.id
        )));
    }

    let key = doc.object_key();
    let stored = deps.objects.latest_version(&key)?.filter(|v| {
        !v.is_delete_marker && v.checksum.as_deref() == Some(doc.checksum.as_str())
    });

    let version_id = match stored {
        Some(version) => {
            debug!(storage_key = %key, "Object already holds this content, skipping write");
            version.version_id
        }
        None => {
            let bytes = deps.staging.read(&ctx.document_id)?;
            if sha256_hex(&bytes) != doc.checksum {
                return Err(StageError::Validation(
                    "staged bytes do not match the recorded checksum".to_string(),
                ));
            }
            deadline.check()?;
            deps.objects
                .upload(&key, &bytes, &content_type(&doc), &object_metadata(&doc))?
                .version_id
        }
    };

    if !deps.documents.mark_active(&doc.id, &key, &version_id)? {
        return Err(StageError::not_found("document", &doc.id));
    }

    Ok(json!({
        "document_id": doc.id,
        "storage_key": key,
        "version_id": version_id,
        "checksum": doc.checksum,
        "size_bytes": doc.size_bytes,
        "deduplicated": doc.id != ctx.document_id,
    }))
}

pub(crate) fn extract_text(
    deps: &StageDeps,
    document_id: &str,
    deadline: &Deadline,
) -> Result<Value, StageError> {
    let doc = require_live_document(deps, document_id)?;
    let key = doc.storage_key.clone().ok_or_else(|| {
        StageError::BusinessRule(format!("document '{}' has not been uploaded", doc.id))
    })?;

    let mut bytes = Vec::new();
    deps.objects
        .stream(&key)?
        .read_to_end(&mut bytes)
        .map_err(|e| StageError::ExternalService {
            service: "object store",
            message: e.to_string(),
        })?;
    deadline.check()?;

    let extension = doc.extension().or_else(|| {
        doc.mime_type
            .as_deref()
            .and_then(mime_guess::get_mime_extensions_str)
            .and_then(|exts| exts.first())
            .map(|e| e.to_string())
    });
    let text = deps
        .extractor
        .extract(&bytes, extension.as_deref().unwrap_or(""))?;

    Ok(json!({
        "char_count": text.chars().count(),
        "page_count": text.matches(PAGE_BREAK).count() + 1,
        "text": text,
    }))
}

pub(crate) fn chunk_text(
    deps: &StageDeps,
    document_id: &str,
    deadline: &Deadline,
) -> Result<Value, StageError> {
    let doc = require_live_document(deps, document_id)?;
    let extraction = deps
        .jobs
        .latest_successful(document_id, JobType::ExtractText)?
        .ok_or_else(|| {
            StageError::BusinessRule(format!("text of '{}' has not been extracted", document_id))
        })?;
    let text = extraction
        .output_data
        .as_ref()
        .and_then(|o| o.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::Validation("extraction output has no text".to_string()))?;

    let chunks = deps.chunker.chunk(
        text,
        &ChunkMetadata {
            document_id: doc.id.clone(),
            filename: doc.filename.clone(),
        },
    )?;
    deadline.check()?;

    Ok(json!({
        "chunk_count": chunks.len(),
        "chunks": chunks,
    }))
}

pub(crate) fn embed_chunks(
    deps: &StageDeps,
    document_id: &str,
    deadline: &Deadline,
) -> Result<Value, StageError> {
    let doc = require_live_document(deps, document_id)?;
    let chunking = deps
        .jobs
        .latest_successful(document_id, JobType::ChunkText)?
        .ok_or_else(|| {
            StageError::BusinessRule(format!("text of '{}' has not been chunked", document_id))
        })?;
    let chunks: Vec<TextChunk> = serde_json::from_value(
        chunking
            .output_data
            .and_then(|o| o.get("chunks").cloned())
            .unwrap_or(Value::Null),
    )?;
    if chunks.is_empty() {
        return Err(StageError::Validation("no chunks to embed".to_string()));
    }

    let outcome = deps.vectors.embed_and_store(&chunks, &doc.id, &doc.user_id)?;
    if outcome.points.is_empty() {
        return Err(StageError::ExternalService {
            service: "vector index",
            message: "no points were stored".to_string(),
        });
    }
    deadline.check()?;

    let now = format_timestamp(Utc::now());
    let rows: Vec<ChunkRow> = outcome
        .points
        .iter()
        .filter_map(|point| {
            chunks
                .iter()
                .find(|c| c.chunk_index == point.chunk_index)
                .map(|chunk| ChunkRow {
                    id: Uuid::new_v4().to_string(),
                    document_id: doc.id.clone(),
                    user_id: doc.user_id.clone(),
                    point_id: point.point_id.clone(),
                    content: chunk.content.clone(),
                    chunk_index: chunk.chunk_index,
                    page_number: chunk.page_number,
                    created_at: now.clone(),
                })
        })
        .collect();
    chunk_repo::replace_for_document(&deps.db, &doc.id, &rows)?;

    let point_ids: Vec<&str> = outcome.points.iter().map(|p| p.point_id.as_str()).collect();
    Ok(json!({
        "added_count": outcome.added_count,
        "point_ids": point_ids,
    }))
}

fn require_live_document(deps: &StageDeps, document_id: &str) -> Result<Document, StageError> {
    let doc = deps
        .documents
        .get_by_id(document_id)?
        .ok_or_else(|| StageError::not_found("document", document_id))?;
    if doc.is_deleted {
        return Err(StageError::BusinessRule(format!(
            "document '{}' is deleted",
            doc.id
        )));
    }
    if doc.storage_status != StorageStatus::Active {
        return Err(StageError::BusinessRule(format!(
            "document '{}' is {}, not ACTIVE",
            doc.id, doc.storage_status
        )));
    }
    Ok(doc)
}

fn content_type(doc: &Document) -> String {
    doc.mime_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn object_metadata(doc: &Document) -> ObjectMetadata {
    ObjectMetadata {
        file_id: doc.id.clone(),
        user_id: doc.user_id.clone(),
        original_filename: doc.filename.clone(),
        checksum: doc.checksum.clone(),
        uploaded_at: Some(Utc::now()),
    }
}
