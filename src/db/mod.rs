//! Database Layer
//!
//! Connection management, SQL dialect mapping, and identifier quoting for the
//! libsql/Turso-backed physical store. Schema DDL generation and execution
//! live one layer up in [`crate::schema`]; CRUD lives in
//! [`crate::services::record_store`].

pub mod connection;
pub mod dialect;
pub mod error;

pub use connection::{quote_ident, Connection};
pub use dialect::{ColumnType, SqlDialect, SqliteDialect};
pub use error::DbError;
