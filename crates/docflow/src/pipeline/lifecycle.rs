//! Soft delete, restore and permanent delete across the object store and
//! the document table.
//!
//! The object store is always written first. When the database step keeps
//! failing, the last attempt undoes the object-store step once. If the undo
//! fails too, the two systems disagree and a critical event is logged for an
//! operator; nothing tries to repair it automatically.

use serde_json::{json, Value};
use tracing::{error, info, info_span, warn};

use crate::documents::Document;
use crate::error::StorageError;
use crate::storage::VersionTarget;

use super::error::StageError;
use super::executor::StageDeps;

/// Logs the critical-inconsistency event for a document whose object and
/// row no longer agree.
pub fn report_inconsistency(document_id: &str, storage_key: &str, operation: &str, reason: &str) {
    error!(
        target: "docflow::critical",
        event = "CriticalInconsistency",
        document_id = %document_id,
        storage_key = %storage_key,
        operation = %operation,
        "Object store and database disagree: {}",
        reason
    );
}

/// Delete marker first, then the row. An already deleted document is a no-op.
pub fn soft_delete(
    deps: &StageDeps,
    document_id: &str,
    is_final_attempt: bool,
) -> Result<Value, StageError> {
    let _span = info_span!("soft_delete", document_id = %document_id).entered();

    let doc = load(deps, document_id)?;
    if doc.is_deleted {
        info!("Document already deleted");
        let marker = match &doc.storage_key {
            Some(key) => deps
                .objects
                .latest_version(key)?
                .filter(|v| v.is_delete_marker)
                .map(|v| v.version_id),
            None => None,
        };
        return Ok(json!({
            "document_id": doc.id,
            "delete_marker_version_id": marker.or(doc.delete_marker_version_id),
            "deleted_at": doc.deleted_at,
        }));
    }
    let key = require_key(&doc)?;

    let outcome = deps.objects.soft_delete(&key)?;
    let marker = outcome.marker_version_id().to_string();

    match deps
        .documents
        .soft_delete(&doc.id, &marker, outcome.deleted_at())
    {
        Ok(true) => {}
        Ok(false) => return Err(StageError::not_found("document", &doc.id)),
        Err(e) => {
            let err = StageError::from(e);
            if is_final_attempt || !err.is_retryable() {
                warn!(storage_key = %key, "Soft delete could not be recorded, removing delete marker");
                if let Err(undo) = deps.objects.restore(&key, &marker) {
                    report_inconsistency(
                        &doc.id,
                        &key,
                        "soft_delete",
                        &format!("delete marker {} left in place: {}", marker, undo),
                    );
                }
            }
            return Err(err);
        }
    }

    info!(storage_key = %key, marker = %marker, "Document soft-deleted");
    Ok(json!({
        "document_id": doc.id,
        "delete_marker_version_id": marker,
        "deleted_at": outcome.deleted_at(),
    }))
}

/// Removes the delete marker `version_id`, then reactivates the row.
pub fn restore(
    deps: &StageDeps,
    document_id: &str,
    version_id: &str,
    is_final_attempt: bool,
) -> Result<Value, StageError> {
    let _span = info_span!("restore", document_id = %document_id).entered();

    let doc = load(deps, document_id)?;
    if !doc.is_deleted {
        return Err(StageError::Validation(format!(
            "document '{}' is not deleted",
            doc.id
        )));
    }
    let key = require_key(&doc)?;

    // The object store owns the current marker. The row can still name an
    // older one when a previous restore was undone and not re-recorded.
    let current = match deps.objects.latest_version(&key)? {
        Some(latest) if latest.is_delete_marker => {
            if latest.version_id != version_id {
                return Err(wrong_marker(&doc, version_id));
            }
            deps.objects.restore(&key, version_id)?
        }
        // A retry after a failed row update finds the marker already gone.
        Some(latest) => {
            if doc.delete_marker_version_id.as_deref() != Some(version_id) {
                return Err(wrong_marker(&doc, version_id));
            }
            latest
        }
        None => return Err(StageError::not_found("object", &key)),
    };

    match deps.documents.restore(&doc.id, Some(&current.version_id)) {
        Ok(true) => {}
        Ok(false) => return Err(StageError::not_found("document", &doc.id)),
        Err(e) => {
            let err = StageError::from(e);
            if is_final_attempt || !err.is_retryable() {
                warn!(storage_key = %key, "Restore could not be recorded, re-adding delete marker");
                match deps.objects.soft_delete(&key) {
                    Ok(undo) => {
                        let marker = undo.marker_version_id();
                        let deleted_at = doc.deleted_at.unwrap_or_else(|| undo.deleted_at());
                        if let Err(e) = deps.documents.soft_delete(&doc.id, marker, deleted_at) {
                            warn!(marker = %marker, "Row still names the previous delete marker: {}", e);
                        }
                    }
                    Err(undo) => report_inconsistency(
                        &doc.id,
                        &key,
                        "restore",
                        &format!("object is live but the row is deleted: {}", undo),
                    ),
                }
            }
            return Err(err);
        }
    }

    info!(storage_key = %key, version_id = %current.version_id, "Document restored");
    Ok(json!({
        "document_id": doc.id,
        "version_id": current.version_id,
    }))
}

/// Removes every object version, the vector points and the row. Jobs and
/// chunk records go with the row.
pub fn permanent_delete(
    deps: &StageDeps,
    document_id: &str,
    is_final_attempt: bool,
) -> Result<Value, StageError> {
    let _span = info_span!("permanent_delete", document_id = %document_id).entered();

    let Some(doc) = deps.documents.get_by_id(document_id)? else {
        info!("Document already gone");
        return Ok(json!({ "document_id": document_id, "deleted": false }));
    };
    let key = require_key(&doc)?;

    let versions_removed = match deps.objects.permanent_delete(&key, &VersionTarget::All) {
        Ok(n) => n,
        Err(StorageError::NotFound { .. }) => {
            warn!(storage_key = %key, "Object already missing");
            0
        }
        Err(e) => return Err(e.into()),
    };

    let points_removed = deps.vectors.delete_document(&doc.id).unwrap_or_else(|e| {
        warn!("Failed to remove vector points: {}", e);
        0
    });

    if let Err(e) = deps.documents.permanent_delete(&doc.id) {
        let err = StageError::from(e);
        if is_final_attempt || !err.is_retryable() {
            report_inconsistency(
                &doc.id,
                &key,
                "permanent_delete",
                &format!("object removed but the row remains: {}", err),
            );
        }
        return Err(err);
    }

    info!(storage_key = %key, versions_removed, "Document permanently deleted");
    Ok(json!({
        "document_id": doc.id,
        "deleted": true,
        "versions_removed": versions_removed,
        "points_removed": points_removed,
    }))
}

fn load(deps: &StageDeps, document_id: &str) -> Result<Document, StageError> {
    deps.documents
        .get_by_id(document_id)?
        .ok_or_else(|| StageError::not_found("document", document_id))
}

fn wrong_marker(doc: &Document, version_id: &str) -> StageError {
    StageError::Validation(format!(
        "version '{}' is not the delete marker of document '{}'",
        version_id, doc.id
    ))
}

fn require_key(doc: &Document) -> Result<String, StageError> {
    doc.storage_key.clone().ok_or_else(|| {
        StageError::Validation(format!("document '{}' has no stored object", doc.id))
    })
}
