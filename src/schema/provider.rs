//! SchemaProvider (spec §4.1, component C1)
//!
//! Pure field-type mapping plus side-effecting DDL against the physical
//! store, grounded on `services/schema_table_manager.rs`'s stateless,
//! caller-owns-the-transaction DDL generator. The provider is parameterized
//! by [`SqlDialect`] so additional dialects are implementable without
//! touching callers.

use crate::db::{Connection, DbError, SqlDialect};
use crate::models::{Field, Table, SYSTEM_COLUMNS};
use crate::schema::error::SchemaError;
use std::sync::Arc;

pub struct SchemaProvider {
    conn: Connection,
    dialect: Arc<dyn SqlDialect>,
}

impl SchemaProvider {
    pub fn new(conn: Connection, dialect: Arc<dyn SqlDialect>) -> Self {
        Self { conn, dialect }
    }

    /// Pure mapping from logical field type to physical column shape.
    pub fn map_field_type(&self, field: &Field) -> crate::db::ColumnType {
        crate::db::dialect::physical_type_for(self.dialect.as_ref(), field)
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote_ident(ident)
    }

    /// Creates the base's physical schema namespace. SQLite has no
    /// schema-namespacing concept (unlike Postgres), so for this dialect this
    /// is an idempotent no-op; the namespace is instead encoded into every
    /// physical table name via [`Table::physical_table_name`].
    #[tracing::instrument(skip(self))]
    pub async fn create_schema(&self, base_id: &str) -> Result<(), SchemaError> {
        tracing::debug!(base_id, "schema namespace is implicit for this dialect");
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` with the system columns of spec §3/§6.
    #[tracing::instrument(skip(self, table))]
    pub async fn create_physical_table(&self, table: &Table) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        let cols: Vec<String> = SYSTEM_COLUMNS
            .iter()
            .map(|(name, ty)| format!("{} {}", self.quote(name), ty))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(&physical),
            cols.join(", ")
        );
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(&sql, ())
            .await
            .map_err(|e| DbError::sql_execution(format!("create_physical_table: {e}")))?;
        Ok(())
    }

    pub(crate) async fn column_exists(&self, physical_table: &str, column: &str) -> Result<bool, SchemaError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(&format!("PRAGMA table_info({})", self.quote(physical_table)), ())
            .await
            .map_err(|e| DbError::sql_execution(format!("table_info: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DbError::sql_execution(format!("table_info: {e}")))?
        {
            let name: String = row
                .get(1)
                .map_err(|e| DbError::sql_execution(format!("table_info row: {e}")))?;
            if name == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pure SQL builder for `ADD COLUMN`, exposed so callers that need the
    /// column add to share a single connection's transaction with other
    /// statements (e.g. `FieldRegistry::create`'s metadata insert, so that a
    /// rollback drops both per spec §5) can compose it themselves instead of
    /// going through [`Self::add_column`].
    pub(crate) fn add_column_sql(&self, table: &Table, field: &Field) -> String {
        let physical = table.physical_table_name();
        let col = self.map_field_type(field);
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote(&physical),
            self.quote(&field.db_field_name),
            col.physical_type
        );
        if let Some(default) = &col.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        sql
    }

    /// Adds a physical column for `field`. Fails with `SchemaConflict` if the
    /// column already exists (spec §4.1).
    #[tracing::instrument(skip(self, table, field))]
    pub async fn add_column(&self, table: &Table, field: &Field) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        if self.column_exists(&physical, &field.db_field_name).await? {
            return Err(SchemaError::SchemaConflict(format!(
                "column {} already exists on {}",
                field.db_field_name, physical
            )));
        }

        let col = self.map_field_type(field);
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote(&physical),
            self.quote(&field.db_field_name),
            col.physical_type
        );
        if let Some(default) = &col.default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }

        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(&sql, ())
            .await
            .map_err(|e| DbError::sql_execution(format!("add_column: {e}")))?;

        if let Some(check) = &col.check {
            self.install_check_trigger(&physical, &field.db_field_name, check)
                .await?;
        }
        Ok(())
    }

    /// Drops a physical column. Idempotent under retry: dropping a column
    /// that no longer exists is a no-op rather than an error (spec §4.1).
    #[tracing::instrument(skip(self, table))]
    pub async fn drop_column(&self, table: &Table, db_field_name: &str) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        if !self.column_exists(&physical, db_field_name).await? {
            tracing::debug!(physical, db_field_name, "drop_column: already absent, no-op");
            return Ok(());
        }
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            &format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote(&physical),
                self.quote(db_field_name)
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("drop_column: {e}")))?;

        for suffix in ["insert", "update"] {
            let trigger = format!("chk_{physical}_{db_field_name}_{suffix}");
            let _ = conn
                .execute(&format!("DROP TRIGGER IF EXISTS {}", self.quote(&trigger)), ())
                .await;
        }
        Ok(())
    }

    /// Changes a column's physical type in place. SQLite has no `ALTER
    /// COLUMN ... TYPE`, so this follows the standard SQLite recipe: add a
    /// shadow column of the new type, copy-cast the data across, drop the
    /// old column, then rename the shadow into place.
    #[tracing::instrument(skip(self, table, field))]
    pub async fn alter_column(&self, table: &Table, field: &Field) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        let col = self.map_field_type(field);
        let shadow = format!("__shadow_{}", field.db_field_name);

        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                self.quote(&physical),
                self.quote(&shadow),
                col.physical_type
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("alter_column (shadow add): {e}")))?;

        conn.execute(
            &format!(
                "UPDATE {} SET {} = CAST({} AS {})",
                self.quote(&physical),
                self.quote(&shadow),
                self.quote(&field.db_field_name),
                col.physical_type
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("alter_column (copy): {e}")))?;

        conn.execute(
            &format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote(&physical),
                self.quote(&field.db_field_name)
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("alter_column (drop old): {e}")))?;

        conn.execute(
            &format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.quote(&physical),
                self.quote(&shadow),
                self.quote(&field.db_field_name)
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("alter_column (rename): {e}")))?;

        Ok(())
    }

    #[tracing::instrument(skip(self, table))]
    pub async fn add_unique_constraint(&self, table: &Table, db_field_name: &str) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        let index_name = format!("uniq_{physical}_{db_field_name}");
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                self.quote(&index_name),
                self.quote(&physical),
                self.quote(db_field_name)
            ),
            (),
        )
        .await
        .map_err(|e| DbError::sql_execution(format!("add_unique_constraint: {e}")))?;
        Ok(())
    }

    /// SQLite has no `ALTER TABLE ... ADD CONSTRAINT CHECK`; this installs
    /// `BEFORE INSERT`/`BEFORE UPDATE` triggers that `RAISE(ABORT, ...)` when
    /// `check_expr` is false, giving the same enforcement.
    #[tracing::instrument(skip(self, table, check_expr))]
    pub async fn add_check_constraint(
        &self,
        table: &Table,
        db_field_name: &str,
        check_expr: &str,
    ) -> Result<(), SchemaError> {
        let physical = table.physical_table_name();
        self.install_check_trigger(&physical, db_field_name, check_expr).await
    }

    /// Creates a manyMany junction table with `__id` plus the two side
    /// columns (spec §4.3 rule 1).
    #[tracing::instrument(skip(self))]
    pub async fn create_junction_table(&self, junction_name: &str, left_col: &str, right_col: &str) -> Result<(), SchemaError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} TEXT NOT NULL, {} TEXT NOT NULL)",
            self.quote(junction_name),
            self.quote("__id"),
            self.quote(left_col),
            self.quote(right_col),
        );
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(&sql, ())
            .await
            .map_err(|e| DbError::sql_execution(format!("create_junction_table: {e}")))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn drop_junction_table(&self, junction_name: &str) -> Result<(), SchemaError> {
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(&format!("DROP TABLE IF EXISTS {}", self.quote(junction_name)), ())
            .await
            .map_err(|e| DbError::sql_execution(format!("drop_junction_table: {e}")))?;
        Ok(())
    }

    pub async fn junction_row_count(&self, junction_name: &str) -> Result<i64, SchemaError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(&format!("SELECT COUNT(*) FROM {}", self.quote(junction_name)), ())
            .await
            .map_err(|e| DbError::sql_execution(format!("junction_row_count: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DbError::sql_execution(format!("junction_row_count: {e}")))?
            .expect("COUNT always returns a row");
        let count: i64 = row.get(0).map_err(|e| DbError::sql_execution(format!("junction_row_count: {e}")))?;
        Ok(count)
    }

    pub async fn junction_distinct_sides(&self, junction_name: &str, side_col: &str) -> Result<i64, SchemaError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT COUNT(DISTINCT {}) FROM {}", self.quote(side_col), self.quote(junction_name)),
                (),
            )
            .await
            .map_err(|e| DbError::sql_execution(format!("junction_distinct_sides: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DbError::sql_execution(format!("junction_distinct_sides: {e}")))?
            .expect("COUNT always returns a row");
        let count: i64 =
            row.get(0).map_err(|e| DbError::sql_execution(format!("junction_distinct_sides: {e}")))?;
        Ok(count)
    }

    async fn install_check_trigger(
        &self,
        physical_table: &str,
        db_field_name: &str,
        check_expr: &str,
    ) -> Result<(), SchemaError> {
        let conn = self.conn.connect_with_timeout().await?;
        for (suffix, event) in [("insert", "INSERT"), ("update", "UPDATE")] {
            let trigger = format!("chk_{physical_table}_{db_field_name}_{suffix}");
            conn.execute(
                &format!(
                    "CREATE TRIGGER IF NOT EXISTS {} BEFORE {} ON {} \
                     WHEN NOT ({}) BEGIN SELECT RAISE(ABORT, 'check constraint failed: {}'); END",
                    self.quote(&trigger),
                    event,
                    self.quote(physical_table),
                    check_expr,
                    db_field_name
                ),
                (),
            )
            .await
            .map_err(|e| DbError::sql_execution(format!("install_check_trigger: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::SqliteDialect;
    use crate::models::{Field, FieldOptions, FieldType, CommonOptions};

    async fn provider() -> SchemaProvider {
        let conn = Connection::open(&EngineConfig::in_memory()).await.unwrap();
        SchemaProvider::new(conn, Arc::new(SqliteDialect))
    }

    fn text_field(table_id: &str, db_field_name: &str) -> Field {
        Field {
            id: crate::ids::field_id(),
            table_id: table_id.to_string(),
            name: db_field_name.to_string(),
            description: None,
            field_type: FieldType::ShortText,
            options: FieldOptions::Plain(CommonOptions::default()),
            db_field_name: db_field_name.to_string(),
            db_field_type: "TEXT".to_string(),
            order: 1,
            required: false,
            unique: false,
            is_primary: false,
        }
    }

    #[tokio::test]
    async fn create_physical_table_is_idempotent() {
        let provider = provider().await;
        let table = Table::new("base_1", "People");
        provider.create_physical_table(&table).await.unwrap();
        provider.create_physical_table(&table).await.unwrap();
    }

    #[tokio::test]
    async fn add_column_twice_is_a_schema_conflict() {
        let provider = provider().await;
        let table = Table::new("base_1", "People");
        provider.create_physical_table(&table).await.unwrap();
        let field = text_field(&table.id, "name");
        provider.add_column(&table, &field).await.unwrap();
        let err = provider.add_column(&table, &field).await.unwrap_err();
        assert!(matches!(err, SchemaError::SchemaConflict(_)));
    }

    #[tokio::test]
    async fn drop_column_is_idempotent_under_retry() {
        let provider = provider().await;
        let table = Table::new("base_1", "People");
        provider.create_physical_table(&table).await.unwrap();
        let field = text_field(&table.id, "name");
        provider.add_column(&table, &field).await.unwrap();
        provider.drop_column(&table, "name").await.unwrap();
        provider.drop_column(&table, "name").await.unwrap();
    }
}
