//! FieldRegistry (spec §4.2, component C2)
//!
//! Stores Field metadata in a `__fields` system table, enforces name
//! uniqueness, assigns `order`, and persists option JSON — grounded on
//! `services/schema_service.rs`'s name-validation/persistence pattern and
//! `models/schema.rs`'s `SchemaField`.
//!
//! Lifecycle hooks fire in strict order: `pre_save → persist → post_save`
//! (spec §4.2); broadcast to the sibling `fld_<tableId>` OT collection
//! happens in `post_save`.

use crate::db::Connection;
use crate::models::{Field, FieldOptions, FieldType};
use crate::schema::SchemaProvider;
use crate::services::error::EngineError;
use crate::services::ot_channel::{OtChannel, OtOp};
use crate::services::table_registry::TableRegistry;
use crate::models::Table;
use std::sync::Arc;

const MAX_FIELD_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct FieldCreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub field_type: FieldType,
    pub options: FieldOptions,
    pub required: bool,
    pub unique: bool,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub options: Option<FieldOptions>,
    pub required: Option<bool>,
    pub unique: Option<bool>,
}

pub struct FieldRegistry {
    conn: Connection,
    schema: Arc<SchemaProvider>,
    ot: Arc<OtChannel>,
    tables: Arc<TableRegistry>,
}

impl FieldRegistry {
    pub fn new(conn: Connection, schema: Arc<SchemaProvider>, ot: Arc<OtChannel>, tables: Arc<TableRegistry>) -> Self {
        Self { conn, schema, ot, tables }
    }

    #[tracing::instrument(skip(self))]
    pub async fn ensure_meta_table(&self) -> Result<(), EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS __fields (
                id TEXT PRIMARY KEY,
                table_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                field_type TEXT NOT NULL,
                options TEXT NOT NULL,
                db_field_name TEXT NOT NULL,
                db_field_type TEXT NOT NULL,
                field_order INTEGER NOT NULL,
                required BOOLEAN NOT NULL DEFAULT FALSE,
                is_unique BOOLEAN NOT NULL DEFAULT FALSE,
                is_primary BOOLEAN NOT NULL DEFAULT FALSE
            )",
            (),
        )
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("ensure_meta_table: {e}")))?;
        Ok(())
    }

    fn validate_name(name: &str) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidFieldName("field name must not be empty".into()));
        }
        if name.len() > MAX_FIELD_NAME_LEN {
            return Err(EngineError::InvalidFieldName(format!(
                "field name exceeds {MAX_FIELD_NAME_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Deterministic, SQL-safe `db_field_name` (spec §3 invariant ii: stable
    /// for the field's lifetime, so renames never touch it).
    fn slugify(name: &str) -> String {
        let mut slug = String::new();
        for c in name.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c);
            } else if !slug.ends_with('_') {
                slug.push('_');
            }
        }
        let slug = slug.trim_matches('_').to_string();
        if slug.is_empty() || slug.chars().next().unwrap().is_ascii_digit() {
            format!("f_{slug}")
        } else {
            slug
        }
    }

    /// Slugify-plus-dedupe, exposed for `LinkSchemaManager` which derives a
    /// Link field's `db_field_name` before it has a `Field` to hand to
    /// `create` (it must settle the physical layout first).
    pub(crate) async fn generate_db_field_name(&self, table_id: &str, name: &str) -> Result<String, EngineError> {
        self.dedupe_db_field_name(table_id, &Self::slugify(name)).await
    }

    pub(crate) async fn next_order_for(&self, table_id: &str) -> Result<i64, EngineError> {
        self.next_order(table_id).await
    }

    async fn dedupe_db_field_name(&self, table_id: &str, base: &str) -> Result<String, EngineError> {
        let existing = self.list_db_field_names(table_id).await?;
        if !existing.contains(&base.to_string()) {
            return Ok(base.to_string());
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    async fn list_db_field_names(&self, table_id: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query("SELECT db_field_name FROM __fields WHERE table_id = ?", [table_id])
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            names.push(row.get::<String>(0).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?);
        }
        Ok(names)
    }

    async fn name_taken(&self, table_id: &str, name: &str, excluding: Option<&str>) -> Result<bool, EngineError> {
        for f in self.list(table_id).await? {
            if f.name == name && excluding != Some(f.id.as_str()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn next_order(&self, table_id: &str) -> Result<i64, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(field_order), 0) FROM __fields WHERE table_id = ?",
                [table_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let row = rows
            .next()
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?
            .expect("COALESCE always returns a row");
        let max: i64 = row.get(0).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        Ok(max + 1)
    }

    /// Creates a field and, unless it is a Link field, its backing physical
    /// column — atomically, so a failure rolls back both (spec §5). Link
    /// fields are metadata-only here: [`crate::services::link_schema_manager::LinkSchemaManager`]
    /// owns their physical layout, which may live on a different table
    /// entirely (spec §4.3).
    #[tracing::instrument(skip(self, table, req), fields(table_id = %table.id))]
    pub async fn create(&self, table: &Table, req: FieldCreateRequest, user: &str) -> Result<Field, EngineError> {
        Self::validate_name(&req.name)?;
        if self.name_taken(&table.id, &req.name, None).await? {
            return Err(EngineError::NameConflict(format!("field name '{}' already in use", req.name)));
        }
        if req.is_primary && self.primary_field(&table.id).await?.is_some() {
            return Err(EngineError::ValidationFailed("table already has a primary field".into()));
        }

        let order = self.next_order(&table.id).await?;
        let db_field_name = self.dedupe_db_field_name(&table.id, &Self::slugify(&req.name)).await?;
        let db_field_type = self.schema.map_field_type(&Field {
            id: String::new(),
            table_id: table.id.clone(),
            name: req.name.clone(),
            description: None,
            field_type: req.field_type,
            options: req.options.clone(),
            db_field_name: db_field_name.clone(),
            db_field_type: String::new(),
            order,
            required: req.required,
            unique: req.unique,
            is_primary: req.is_primary,
        }).physical_type;

        let field = Field {
            id: crate::ids::field_id(),
            table_id: table.id.clone(),
            name: req.name,
            description: req.description,
            field_type: req.field_type,
            options: req.options,
            db_field_name,
            db_field_type,
            order,
            required: req.required,
            unique: req.unique,
            is_primary: req.is_primary,
        };

        self.create_metadata(table, field, user).await
    }

    /// Same as [`Self::create`], but rejects a computed field whose formula
    /// would introduce a dependency cycle (spec §4.4 invariant ii) before
    /// any metadata is persisted.
    pub async fn create_checked(
        &self,
        table: &Table,
        req: FieldCreateRequest,
        user: &str,
        dependencies: &crate::services::dependency_graph::DependencyGraph,
    ) -> Result<Field, EngineError> {
        if req.field_type.is_computed() {
            let existing = self.list(&table.id).await?;
            let by_name: std::collections::HashMap<String, &Field> =
                existing.iter().map(|f| (f.name.clone(), f)).collect();
            let new_deps = crate::services::dependency_graph::DependencyGraph::dependency_ids(&req.options, &by_name);
            // The new field has no id yet; `check_acyclic` keys candidate
            // edges by the field's own (future) name since that's what
            // formula references resolve against.
            dependencies.check_acyclic(&table.id, &format!("pending:{}", req.name), &new_deps).await?;
        }
        let field = self.create(table, req, user).await?;
        dependencies.invalidate(&table.id);
        Ok(field)
    }

    /// Same as [`Self::update`], but rejects a patch that would introduce a
    /// dependency cycle (spec §4.4 invariant ii).
    pub async fn update_checked(
        &self,
        field_id: &str,
        patch: FieldPatch,
        dependencies: &crate::services::dependency_graph::DependencyGraph,
    ) -> Result<Field, EngineError> {
        let current = self.get(field_id).await?;
        if let Some(options) = &patch.options {
            if current.field_type.is_computed() {
                let existing = self.list(&current.table_id).await?;
                let by_name: std::collections::HashMap<String, &Field> =
                    existing.iter().map(|f| (f.name.clone(), f)).collect();
                let new_deps = crate::services::dependency_graph::DependencyGraph::dependency_ids(options, &by_name);
                dependencies.check_acyclic(&current.table_id, field_id, &new_deps).await?;
            }
        }
        let field = self.update(field_id, patch).await?;
        dependencies.invalidate(&field.table_id);
        Ok(field)
    }

    /// Persists a fully-formed [`Field`] (metadata only, no physical DDL for
    /// Link fields). Used directly by `create` for ordinary fields and by
    /// `LinkSchemaManager` once it has derived a Link field's layout.
    #[tracing::instrument(skip(self, table, field), fields(table_id = %table.id, field_id = %field.id))]
    pub async fn create_metadata(&self, table: &Table, field: Field, _user: &str) -> Result<Field, EngineError> {
        self.pre_save(&field)?;

        let conn = self.conn.connect_with_timeout().await?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| crate::db::DbError::sql_execution(format!("BEGIN: {e}")))?;

        let insert = conn
            .execute(
                "INSERT INTO __fields (id, table_id, name, description, field_type, options, db_field_name, db_field_type, field_order, required, is_unique, is_primary)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    field.id.clone(),
                    field.table_id.clone(),
                    field.name.clone(),
                    field.description.clone(),
                    serde_json::to_string(&field.field_type).unwrap(),
                    serde_json::to_string(&field.options).unwrap(),
                    field.db_field_name.clone(),
                    field.db_field_type.clone(),
                    field.order,
                    field.required,
                    field.unique,
                    field.is_primary,
                ],
            )
            .await;

        if let Err(e) = insert {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(crate::db::DbError::sql_execution(format!("insert field: {e}")).into());
        }

        if field.field_type != FieldType::Link {
            let sql = self.schema.add_column_sql(table, &field);
            if let Err(e) = conn.execute(&sql, ()).await {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(crate::db::DbError::sql_execution(format!("add column: {e}")).into());
            }
        }

        conn.execute("COMMIT", ())
            .await
            .map_err(|e| crate::db::DbError::sql_execution(format!("COMMIT: {e}")))?;

        self.post_save(&field).await;
        Ok(field)
    }

    fn pre_save(&self, field: &Field) -> Result<(), EngineError> {
        match &field.options {
            FieldOptions::Link(opts) if opts.foreign_table_id.is_empty() => {
                Err(EngineError::InvalidOption("link field requires foreign_table_id".into()))
            }
            _ => Ok(()),
        }
    }

    async fn post_save(&self, field: &Field) {
        let op = OtOp::field_changed(field);
        if let Err(e) = self.ot.publish(&format!("fld_{}", field.table_id), &field.id, op).await {
            tracing::warn!(error = %e, field_id = %field.id, "field-schema broadcast failed");
        }
    }

    #[tracing::instrument(skip(self, patch))]
    pub async fn update(&self, field_id: &str, patch: FieldPatch) -> Result<Field, EngineError> {
        let mut field = self.get(field_id).await?;

        if let Some(name) = &patch.name {
            Self::validate_name(name)?;
            if self.name_taken(&field.table_id, name, Some(field_id)).await? {
                return Err(EngineError::NameConflict(format!("field name '{name}' already in use")));
            }
            field.name = name.clone();
        }
        if let Some(description) = patch.description {
            field.description = description;
        }
        if let Some(options) = patch.options {
            field.options = options;
        }
        if let Some(required) = patch.required {
            field.required = required;
        }
        if let Some(unique) = patch.unique {
            field.unique = unique;
        }

        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            "UPDATE __fields SET name = ?, description = ?, options = ?, required = ?, is_unique = ? WHERE id = ?",
            libsql::params![
                field.name.clone(),
                field.description.clone(),
                serde_json::to_string(&field.options).unwrap(),
                field.required,
                field.unique,
                field.id.clone(),
            ],
        )
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("update field: {e}")))?;

        self.post_save(&field).await;
        Ok(field)
    }

    /// Deletes the `__fields` metadata row and, for ordinary (non-Link)
    /// fields, the backing physical column (spec §8 round-trip: no orphan
    /// columns survive a `create` → `delete`). Link fields have no column
    /// of their own here — their physical layout is owned by
    /// `LinkSchemaManager`, which drops it before calling this method.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, field_id: &str) -> Result<Field, EngineError> {
        let field = self.get(field_id).await?;
        if field.is_primary {
            return Err(EngineError::cannot_delete_primary());
        }
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute("DELETE FROM __fields WHERE id = ?", [field_id])
            .await
            .map_err(|e| crate::db::DbError::sql_execution(format!("delete field: {e}")))?;

        if field.field_type != FieldType::Link {
            let table = self.tables.get(&field.table_id).await?;
            if let Err(e) = self.schema.drop_column(&table, &field.db_field_name).await {
                tracing::warn!(error = %e, field_id = %field.id, "failed to drop physical column for deleted field");
            }
        }

        Ok(field)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, field_id: &str) -> Result<Field, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT id, table_id, name, description, field_type, options, db_field_name, db_field_type, field_order, required, is_unique, is_primary FROM __fields WHERE id = ?",
                [field_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        match rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            Some(row) => Ok(row_to_field(&row)?),
            None => Err(EngineError::FieldNotFound(field_id.to_string())),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, table_id: &str) -> Result<Vec<Field>, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT id, table_id, name, description, field_type, options, db_field_name, db_field_type, field_order, required, is_unique, is_primary FROM __fields WHERE table_id = ? ORDER BY field_order ASC, id ASC",
                [table_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let mut fields = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            fields.push(row_to_field(&row)?);
        }
        Ok(fields)
    }

    pub async fn get_by_names(&self, table_id: &str, names: &[String]) -> Result<Vec<Field>, EngineError> {
        let all = self.list(table_id).await?;
        Ok(all.into_iter().filter(|f| names.contains(&f.name)).collect())
    }

    pub async fn primary_field(&self, table_id: &str) -> Result<Option<Field>, EngineError> {
        Ok(self.list(table_id).await?.into_iter().find(|f| f.is_primary))
    }

    /// All Link fields anywhere whose `foreign_table_id` is `table_id` — the
    /// discovery step of `LinkTitleUpdater` (spec §4.6 step 1).
    #[tracing::instrument(skip(self))]
    pub async fn list_links_to_table(&self, table_id: &str) -> Result<Vec<Field>, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT id, table_id, name, description, field_type, options, db_field_name, db_field_type, field_order, required, is_unique, is_primary
                 FROM __fields WHERE field_type = '\"link\"' AND json_extract(options, '$.foreignTableId') = ?",
                [table_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let mut fields = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            fields.push(row_to_field(&row)?);
        }
        Ok(fields)
    }
}

fn row_to_field(row: &libsql::Row) -> Result<Field, EngineError> {
    let field_type_str: String = row.get(4).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let options_str: String = row.get(5).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    Ok(Field {
        id: row.get(0).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        table_id: row.get(1).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        name: row.get(2).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        description: row.get(3).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        field_type: serde_json::from_str(&field_type_str)
            .map_err(|e| EngineError::InternalError(format!("corrupt field_type: {e}")))?,
        options: serde_json::from_str(&options_str)
            .map_err(|e| EngineError::InternalError(format!("corrupt options: {e}")))?,
        db_field_name: row.get(6).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        db_field_type: row.get(7).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        order: row.get(8).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        required: row.get(9).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        unique: row.get(10).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        is_primary: row.get(11).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::SqliteDialect;
    use crate::models::CommonOptions;

    async fn setup() -> (FieldRegistry, Table) {
        let conn = Connection::open(&EngineConfig::in_memory()).await.unwrap();
        let schema = Arc::new(SchemaProvider::new(conn.clone(), Arc::new(SqliteDialect)));
        let ot = Arc::new(OtChannel::new());
        let tables = Arc::new(TableRegistry::new(conn.clone()));
        tables.ensure_meta_table().await.unwrap();
        let registry = FieldRegistry::new(conn, schema.clone(), ot, tables.clone());
        registry.ensure_meta_table().await.unwrap();
        let table = Table::new("base_1", "People");
        schema.create_physical_table(&table).await.unwrap();
        tables.create(&table).await.unwrap();
        (registry, table)
    }

    fn plain_request(name: &str) -> FieldCreateRequest {
        FieldCreateRequest {
            name: name.to_string(),
            description: None,
            field_type: FieldType::ShortText,
            options: FieldOptions::Plain(CommonOptions::default()),
            required: false,
            unique: false,
            is_primary: false,
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_order_and_db_field_name() {
        let (registry, table) = setup().await;
        let a = registry.create(&table, plain_request("Name"), "user_1").await.unwrap();
        let b = registry.create(&table, plain_request("Email"), "user_1").await.unwrap();
        assert_eq!(a.order, 1);
        assert_eq!(b.order, 2);
        assert_eq!(a.db_field_name, "name");
    }

    #[tokio::test]
    async fn duplicate_name_is_a_name_conflict() {
        let (registry, table) = setup().await;
        registry.create(&table, plain_request("Name"), "user_1").await.unwrap();
        let err = registry.create(&table, plain_request("Name"), "user_1").await.unwrap_err();
        assert!(matches!(err, EngineError::NameConflict(_)));
    }

    #[tokio::test]
    async fn rename_preserves_db_field_name() {
        let (registry, table) = setup().await;
        let field = registry.create(&table, plain_request("Name"), "user_1").await.unwrap();
        let updated = registry
            .update(&field.id, FieldPatch { name: Some("Full Name".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(updated.name, "Full Name");
        assert_eq!(updated.db_field_name, "name");
    }

    #[tokio::test]
    async fn deleting_the_primary_field_is_rejected() {
        let (registry, table) = setup().await;
        let mut req = plain_request("Name");
        req.is_primary = true;
        let field = registry.create(&table, req, "user_1").await.unwrap();
        let err = registry.delete(&field.id).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
    }

    /// Spec §8 round-trip: `create(field) → delete(field)` must leave no
    /// orphan physical column behind.
    #[tokio::test]
    async fn deleting_a_field_drops_its_physical_column() {
        let (registry, table) = setup().await;
        let field = registry.create(&table, plain_request("Nickname"), "user_1").await.unwrap();

        let conn = registry.conn.connect_with_timeout().await.unwrap();
        let mut rows = conn
            .query(&format!("PRAGMA table_info({})", table.physical_table_name()), ())
            .await
            .unwrap();
        let mut found = false;
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(1).unwrap();
            if name == field.db_field_name {
                found = true;
            }
        }
        assert!(found, "column should exist right after creation");

        registry.delete(&field.id).await.unwrap();

        let mut rows = conn
            .query(&format!("PRAGMA table_info({})", table.physical_table_name()), ())
            .await
            .unwrap();
        let mut still_present = false;
        while let Some(row) = rows.next().await.unwrap() {
            let name: String = row.get(1).unwrap();
            if name == field.db_field_name {
                still_present = true;
            }
        }
        assert!(!still_present, "column should be dropped after field delete");
    }

    #[tokio::test]
    async fn field_at_max_name_length_is_accepted_one_over_is_rejected() {
        let (registry, table) = setup().await;
        let max_name = "a".repeat(255);
        registry.create(&table, plain_request(&max_name), "user_1").await.unwrap();
        let too_long = "a".repeat(256);
        let err = registry.create(&table, plain_request(&too_long), "user_1").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidFieldName(_)));
    }
}
