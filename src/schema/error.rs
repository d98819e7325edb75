use crate::db::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    /// Attempted to ADD a column/constraint that already exists.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error(transparent)]
    Db(#[from] DbError),
}
