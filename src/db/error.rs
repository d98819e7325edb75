//! Database-layer error types
//!
//! Mirrors the teacher's `db::error::DatabaseError`: infrastructure failures
//! only, kept separate from service-level validation/conflict errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed { path: PathBuf, source: libsql::Error },

    #[error("Failed to initialize schema: {0}")]
    InitializationFailed(String),

    #[error("Failed to create parent directory: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    #[error("libsql error: {0}")]
    Libsql(#[from] libsql::Error),

    #[error("SQL execution failed: {context}")]
    SqlExecution { context: String },

    #[error("transaction failed: {context}")]
    Transaction { context: String },
}

impl DbError {
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecution { context: context.into() }
    }

    pub fn transaction(context: impl Into<String>) -> Self {
        Self::Transaction { context: context.into() }
    }
}
