//! TableRegistry — minimal table metadata store backing the data model of
//! spec §3 (Space/Base/Table/Field/Record/View ownership hierarchy). Not
//! one of the spec's seven core components, but required scaffolding since
//! `LinkSchemaManager` and `RecordStore` both need to resolve a `tableId`
//! into its `Table` (physical name, base) and enumerate a base's tables.
//! Grounded on the same `__fields`-style system-table pattern as
//! `FieldRegistry`.

use crate::db::Connection;
use crate::models::Table;
use crate::services::error::EngineError;
use libsql::params;

pub struct TableRegistry {
    conn: Connection,
}

impl TableRegistry {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    #[tracing::instrument(skip(self))]
    pub async fn ensure_meta_table(&self) -> Result<(), EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS __tables (
                id TEXT PRIMARY KEY,
                base_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_time TEXT NOT NULL,
                updated_time TEXT NOT NULL
            )",
            (),
        )
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("ensure_meta_table: {e}")))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, table))]
    pub async fn create(&self, table: &Table) -> Result<(), EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        conn.execute(
            "INSERT INTO __tables (id, base_id, name, version, created_time, updated_time) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                table.id.clone(),
                table.base_id.clone(),
                table.name.clone(),
                table.version,
                table.created_time.to_rfc3339(),
                table.updated_time.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("insert table: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, table_id: &str) -> Result<Table, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT id, base_id, name, version, created_time, updated_time FROM __tables WHERE id = ?",
                [table_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        match rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            Some(row) => row_to_table(&row),
            None => Err(EngineError::TableNotFound(table_id.to_string())),
        }
    }

    pub async fn list_by_base(&self, base_id: &str) -> Result<Vec<Table>, EngineError> {
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                "SELECT id, base_id, name, version, created_time, updated_time FROM __tables WHERE base_id = ?",
                [base_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let mut tables = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            tables.push(row_to_table(&row)?);
        }
        Ok(tables)
    }
}

fn row_to_table(row: &libsql::Row) -> Result<Table, EngineError> {
    use chrono::{DateTime, Utc};
    let created: String = row.get(4).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let updated: String = row.get(5).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    Ok(Table {
        id: row.get(0).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        base_id: row.get(1).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        name: row.get(2).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        version: row.get(3).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?,
        created_time: created.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        updated_time: updated.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}
