//! SQL dialect abstraction (spec §4.1)
//!
//! `SchemaProvider` is parameterized by dialect so that one can be fully
//! supported while the abstraction stays open to others. Only the SQLite
//! (libsql/Turso) dialect is implemented here; see `DESIGN.md` for why it was
//! chosen over the teacher's optional SurrealDB backend.

use crate::models::{Field, FieldType};

/// Physical-column definition produced by [`SqlDialect::map_field_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    /// The physical SQL type, e.g. `TEXT`, `NUMERIC`, `JSON`.
    pub physical_type: String,
    /// `DEFAULT` clause body, if any (without the `DEFAULT` keyword).
    pub default: Option<String>,
    /// A boolean SQL expression enforced via a trigger-based check
    /// constraint (see [`super::provider`] — SQLite has no `ALTER TABLE ...
    /// ADD CONSTRAINT CHECK`).
    pub check: Option<String>,
}

pub trait SqlDialect: Send + Sync {
    /// Pure mapping from a logical field type to its physical column shape.
    fn map_field_type(&self, field_type: FieldType) -> ColumnType;

    /// Quotes an identifier for this dialect.
    fn quote_ident(&self, ident: &str) -> String {
        super::connection::quote_ident(ident)
    }
}

/// The SQLite/libsql dialect. JSON-shaped columns (link, multiSelect,
/// attachment, user) are stored as `JSON` text columns and manipulated with
/// SQLite's `json_set`/`json_extract`/`json_each`, which stand in for
/// Postgres JSONB operators (spec §3 invariant iii: link's `db_field_type`
/// is always JSONB-equivalent).
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn map_field_type(&self, field_type: FieldType) -> ColumnType {
        use FieldType::*;
        match field_type {
            ShortText | LongText | Email | Phone | Url | Button => ColumnType {
                physical_type: "TEXT".into(),
                default: None,
                check: None,
            },
            Number | Rating | Duration => ColumnType {
                physical_type: "NUMERIC".into(),
                default: None,
                check: None,
            },
            Checkbox => ColumnType {
                physical_type: "BOOLEAN".into(),
                default: Some("FALSE".into()),
                check: None,
            },
            Date | DateTime => ColumnType {
                physical_type: "TIMESTAMP".into(),
                default: None,
                check: None,
            },
            SingleSelect => ColumnType {
                physical_type: "TEXT".into(),
                default: None,
                check: None,
            },
            MultiSelect | Link | Attachment | User => ColumnType {
                physical_type: "JSON".into(),
                default: None,
                check: None,
            },
            Formula | Rollup | Lookup | Count | Ai => ColumnType {
                // Computed fields store their last-recomputed materialized
                // value; shape depends on the underlying expression/target.
                physical_type: "JSON".into(),
                default: None,
                check: None,
            },
        }
    }
}

/// Returns the physical column type for a [`Field`], honoring the invariant
/// that Link fields are always JSONB-equivalent (spec §3 invariant iii).
pub fn physical_type_for(dialect: &dyn SqlDialect, field: &Field) -> ColumnType {
    let mut col = dialect.map_field_type(field.field_type);
    if field.field_type == FieldType::Link {
        col.physical_type = "JSON".into();
    }
    col
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_fields_are_always_jsonb_equivalent() {
        let dialect = SqliteDialect;
        assert_eq!(dialect.map_field_type(FieldType::Link).physical_type, "JSON");
        assert_eq!(dialect.map_field_type(FieldType::MultiSelect).physical_type, "JSON");
    }

    #[test]
    fn scalar_types_map_to_expected_sqlite_types() {
        let dialect = SqliteDialect;
        assert_eq!(dialect.map_field_type(FieldType::ShortText).physical_type, "TEXT");
        assert_eq!(dialect.map_field_type(FieldType::Number).physical_type, "NUMERIC");
        assert_eq!(dialect.map_field_type(FieldType::Checkbox).default.as_deref(), Some("FALSE"));
    }
}
