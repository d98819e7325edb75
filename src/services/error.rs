//! Unified service-layer error type (spec §7)
//!
//! Generalizes the teacher's `NodeServiceError` into the full error-kind
//! taxonomy spec §7 requires: Validation, Conflict, NotFound, Permission,
//! Infrastructure, Internal. Every surfaced error exposes a stable `code()`,
//! a `message()`, and an optional `details()` map, so the excluded HTTP layer
//! can render spec §7's user-visible contract without this crate depending
//! on a web framework.

use crate::cancel::Canceled;
use crate::db::DbError;
use crate::schema::SchemaError;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // --- Validation ---
    #[error("invalid field type: {0}")]
    InvalidFieldType(String),
    #[error("invalid field name: {0}")]
    InvalidFieldName(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    // --- Conflict ---
    #[error("name conflict: {0}")]
    NameConflict(String),
    #[error("version conflict, current version is {current}")]
    VersionConflict { current: i64 },
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
    #[error("migration conflict: {0}")]
    MigrationConflict(String),

    // --- NotFound ---
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("field not found: {0}")]
    FieldNotFound(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),

    // --- Permission ---
    #[error("forbidden: {0}")]
    Forbidden(String),

    // --- Infrastructure ---
    #[error("database error: {0}")]
    DbError(String),
    #[error("pub/sub error: {0}")]
    PubSubError(String),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out")]
    Timeout,

    // --- Internal ---
    #[error("internal error: {0}")]
    InternalError(String),
}

impl EngineError {
    pub fn cannot_delete_primary() -> Self {
        Self::ValidationFailed("cannot delete the primary field".to_string())
    }

    /// Stable, machine-readable code (spec §7 "every surfaced error carries
    /// `code`").
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFieldType(_) => "INVALID_FIELD_TYPE",
            Self::InvalidFieldName(_) => "INVALID_FIELD_NAME",
            Self::InvalidOption(_) => "INVALID_OPTION",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::NameConflict(_) => "NAME_CONFLICT",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::SchemaConflict(_) => "SCHEMA_CONFLICT",
            Self::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            Self::MigrationConflict(_) => "MIGRATION_CONFLICT",
            Self::TableNotFound(_) => "TABLE_NOT_FOUND",
            Self::FieldNotFound(_) => "FIELD_NOT_FOUND",
            Self::RecordNotFound(_) => "RECORD_NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::DbError(_) => "DB_ERROR",
            Self::PubSubError(_) => "PUBSUB_ERROR",
            Self::Canceled => "CANCELED",
            Self::Timeout => "TIMEOUT",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Structured extra context (spec §7: `VersionConflict` carries the
    /// current version, `CircularDependency` carries the cycle path).
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::VersionConflict { current } => Some(json!({ "current": current })),
            Self::CircularDependency { cycle } => Some(json!({ "cycle": cycle })),
            _ => None,
        }
    }

    /// Whether this error kind is "expected" per spec §7's propagation
    /// policy (validation/conflict/not-found are not logged at error level).
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            Self::DbError(_) | Self::PubSubError(_) | Self::InternalError(_)
        )
    }
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        tracing::warn!(error = %e, "infrastructure error from database layer");
        Self::DbError(e.to_string())
    }
}

impl From<SchemaError> for EngineError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::SchemaConflict(msg) => Self::SchemaConflict(msg),
            SchemaError::Db(db) => db.into(),
        }
    }
}

impl From<Canceled> for EngineError {
    fn from(_: Canceled) -> Self {
        Self::Canceled
    }
}
