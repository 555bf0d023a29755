//! Document version chain.
//!
//! The `elements` row always holds the head; every version (including the
//! first) is also recorded in `document_versions`. Version pointers are
//! `<documentId>@v<N>` strings, so version `k` links back to `k-1` and the
//! first version links to nothing. Rollback never destroys history: it
//! writes a new head whose content equals the requested version.

use crate::core::db::Database;
use crate::core::error::{ElementalError, ErrorKind};
use crate::core::model::{self, ContentType, DocumentPayload};
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::json;
use std::str::FromStr;

/// One stored version of a document.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVersion {
    pub document_id: String,
    pub version: i64,
    pub content: String,
    pub content_type: ContentType,
    pub previous_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Stable pointer for a version row.
pub fn version_pointer(document_id: &str, version: i64) -> String {
    format!("{document_id}@v{version}")
}

fn require_document(db: &Database, document_id: &str) -> Result<(), ElementalError> {
    let element_type: Option<String> = db.query_one(
        "SELECT type FROM elements WHERE id = ?1",
        [document_id],
        |row| row.get(0),
    )?;
    match element_type.as_deref() {
        Some("document") => Ok(()),
        Some(other) => Err(ElementalError::validation(format!(
            "{document_id} is a {other}, not a document"
        ))
        .with_detail("id", json!(document_id))
        .with_detail("type", json!(other))),
        None => Err(ElementalError::new(
            ErrorKind::DocumentNotFound,
            format!("document not found: {document_id}"),
        )
        .with_detail("id", json!(document_id))),
    }
}

/// Append one version row. The caller owns the surrounding transaction and
/// the head-row update.
pub fn record_version(
    db: &Database,
    document_id: &str,
    payload: &DocumentPayload,
    created_by: &str,
    created_at: &str,
) -> Result<(), ElementalError> {
    db.run(
        "INSERT INTO document_versions(document_id, version, content, content_type, previous_version_id, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            document_id,
            payload.version,
            payload.content,
            payload.content_type.as_str(),
            payload.previous_version_id,
            created_at,
            created_by,
        ],
    )?;
    Ok(())
}

/// Build the successor payload for a content update. Pure; validates the
/// new content against its (possibly changed) content type.
pub fn next_version(
    document_id: &str,
    current: &DocumentPayload,
    content: String,
    content_type: Option<ContentType>,
) -> Result<DocumentPayload, ElementalError> {
    let content_type = content_type.unwrap_or(current.content_type);
    model::validate_document_content(content_type, &content)?;
    Ok(DocumentPayload {
        content_type,
        content,
        version: current.version + 1,
        previous_version_id: Some(version_pointer(document_id, current.version)),
    })
}

/// Full version history, newest first.
pub fn history(db: &Database, document_id: &str) -> Result<Vec<DocumentVersion>, ElementalError> {
    require_document(db, document_id)?;
    db.query(
        "SELECT document_id, version, content, content_type, previous_version_id, created_at, created_by
         FROM document_versions WHERE document_id = ?1 ORDER BY version DESC",
        [document_id],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        },
    )
    .map(|rows| rows.into_iter().map(materialize_row).collect())
}

fn materialize_row(
    row: (String, i64, String, String, Option<String>, String, String),
) -> DocumentVersion {
    let (document_id, version, content, content_type, previous_version_id, created_at, created_by) =
        row;
    DocumentVersion {
        document_id,
        version,
        content,
        content_type: ContentType::from_str(&content_type).unwrap_or_default(),
        previous_version_id,
        created_at: time::parse_iso(&created_at).unwrap_or_default(),
        created_by,
    }
}

/// A single version, or `None` when the ordinal was never written.
pub fn get_version(
    db: &Database,
    document_id: &str,
    version: i64,
) -> Result<Option<DocumentVersion>, ElementalError> {
    require_document(db, document_id)?;
    let row = db.query_one(
        "SELECT document_id, version, content, content_type, previous_version_id, created_at, created_by
         FROM document_versions WHERE document_id = ?1 AND version = ?2",
        params![document_id, version],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        },
    )?;
    Ok(row.map(materialize_row))
}

/// Build the head payload produced by rolling back to `version`.
///
/// The result is a brand-new version (`current + 1`) carrying the old
/// content; the caller persists it like any other content update.
pub fn rollback_payload(
    db: &Database,
    document_id: &str,
    current: &DocumentPayload,
    version: i64,
) -> Result<DocumentPayload, ElementalError> {
    let Some(old) = get_version(db, document_id, version)? else {
        return Err(ElementalError::not_found(format!(
            "document {document_id} has no version {version}"
        ))
        .with_detail("id", json!(document_id))
        .with_detail("version", json!(version)));
    };
    next_version(document_id, current, old.content, Some(old.content_type))
}
