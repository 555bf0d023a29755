//! Error types for Elemental operations.
//!
//! This module defines the canonical error type used throughout the engine.
//! All subsystems return `Result<T, ElementalError>`. Every error carries a
//! stable machine code (`ErrorKind`), a human message, and a structured
//! details map; engine-level SQLite failures are reclassified at the storage
//! boundary so callers never match on `rusqlite` types.

use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

/// Stable error taxonomy shared by every subsystem.
///
/// Codes are transport-agnostic: the CLI maps them to exit codes and the
/// network collaborators map them to HTTP statuses via [`ErrorKind::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    InvalidId,
    InvalidContentType,
    InvalidJson,
    MissingRequiredField,
    TitleTooLong,
    InvalidStatus,
    NotFound,
    EntityNotFound,
    DocumentNotFound,
    ChannelNotFound,
    PlaybookNotFound,
    AlreadyExists,
    DuplicateDependency,
    CycleDetected,
    HasDependents,
    Immutable,
    MemberRequired,
    MaxDepthExceeded,
    Conflict,
    DatabaseError,
    ExportFailed,
    ImportFailed,
    MigrationFailed,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::InvalidId => "INVALID_ID",
            Self::InvalidContentType => "INVALID_CONTENT_TYPE",
            Self::InvalidJson => "INVALID_JSON",
            Self::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Self::TitleTooLong => "TITLE_TOO_LONG",
            Self::InvalidStatus => "INVALID_STATUS",
            Self::NotFound => "NOT_FOUND",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::ChannelNotFound => "CHANNEL_NOT_FOUND",
            Self::PlaybookNotFound => "PLAYBOOK_NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::DuplicateDependency => "DUPLICATE_DEPENDENCY",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::HasDependents => "HAS_DEPENDENTS",
            Self::Immutable => "IMMUTABLE",
            Self::MemberRequired => "MEMBER_REQUIRED",
            Self::MaxDepthExceeded => "MAX_DEPTH_EXCEEDED",
            Self::Conflict => "CONFLICT",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::ExportFailed => "EXPORT_FAILED",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::MigrationFailed => "MIGRATION_FAILED",
        }
    }

    /// Fixed kind-to-HTTP map for network collaborators.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation
            | Self::InvalidId
            | Self::InvalidContentType
            | Self::InvalidJson
            | Self::MissingRequiredField
            | Self::TitleTooLong
            | Self::InvalidStatus
            | Self::MemberRequired
            | Self::MaxDepthExceeded => 400,
            Self::NotFound
            | Self::EntityNotFound
            | Self::DocumentNotFound
            | Self::ChannelNotFound
            | Self::PlaybookNotFound => 404,
            Self::AlreadyExists
            | Self::DuplicateDependency
            | Self::CycleDetected
            | Self::HasDependents
            | Self::Immutable
            | Self::Conflict => 409,
            Self::DatabaseError
            | Self::ExportFailed
            | Self::ImportFailed
            | Self::MigrationFailed => 500,
        }
    }

    /// Exit code for CLI collaborators (informative map from the config surface).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound
            | Self::EntityNotFound
            | Self::DocumentNotFound
            | Self::ChannelNotFound
            | Self::PlaybookNotFound => 3,
            Self::Validation
            | Self::InvalidId
            | Self::InvalidContentType
            | Self::InvalidJson
            | Self::MissingRequiredField
            | Self::TitleTooLong
            | Self::InvalidStatus
            | Self::MemberRequired
            | Self::MaxDepthExceeded => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Canonical error type for all Elemental operations.
///
/// Errors propagate unchanged up the stack; boundaries may attach contextual
/// details via [`ElementalError::with_detail`] but must preserve the kind and
/// the underlying cause.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct ElementalError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Map<String, Value>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ElementalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DatabaseError, message)
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether a retry may succeed (lock contention, busy database).
    pub fn is_retryable(&self) -> bool {
        self.details
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Serialized shape consumed by CLI/network collaborators:
    /// `{name, message, code, details, httpStatus}`.
    pub fn to_json(&self) -> Value {
        json!({
            "name": "ElementalError",
            "message": self.message,
            "code": self.kind.code(),
            "details": Value::Object(self.details.clone()),
            "httpStatus": self.kind.http_status(),
        })
    }
}

/// Reclassify engine-level SQLite failures into the taxonomy.
///
/// Uniqueness violations are mapped by the storage layer into
/// `ALREADY_EXISTS` / `DUPLICATE_DEPENDENCY` where the offending table is
/// known; everything surfacing here keeps `DATABASE_ERROR` with the busy
/// class marked retryable.
impl From<rusqlite::Error> for ElementalError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        let (kind, retryable) = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::ConstraintViolation => (ErrorKind::DatabaseError, false),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    (ErrorKind::DatabaseError, true)
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    (ErrorKind::DatabaseError, false)
                }
                _ => (ErrorKind::DatabaseError, false),
            },
            rusqlite::Error::QueryReturnedNoRows => (ErrorKind::NotFound, false),
            _ => (ErrorKind::DatabaseError, false),
        };
        let mut mapped = ElementalError::new(kind, format!("SQLite error: {err}"));
        if retryable {
            mapped = mapped.with_detail("retryable", Value::Bool(true));
        }
        mapped.with_cause(err)
    }
}

impl From<std::io::Error> for ElementalError {
    fn from(err: std::io::Error) -> Self {
        ElementalError::database(format!("I/O error: {err}")).with_cause(err)
    }
}

/// Infer the offending `table.column` from a SQLite unique-violation message
/// (e.g. `UNIQUE constraint failed: elements.id`).
pub fn unique_violation_target(err: &rusqlite::Error) -> Option<String> {
    let text = err.to_string();
    let rest = text.split("UNIQUE constraint failed:").nth(1)?;
    Some(rest.split(',').next()?.trim().to_string())
}

/// True when the error is a SQLite unique-constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// True when the error is a SQLite foreign-key violation.
pub fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}
