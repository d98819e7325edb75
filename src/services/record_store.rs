//! RecordStore (spec §4.5, component C5)
//!
//! CRUD against a table's physical rows, keyed by logical `fieldId` on the
//! way in/out and by `db_field_name` physically — grounded on
//! `db/node_store.rs`'s `NodeStore` async-trait abstraction and its
//! batch-create/update helpers' BEGIN/COMMIT accumulation pattern.

use crate::config::EngineConfig;
use crate::db::Connection;
use crate::models::{Field, FieldType, Record};
use crate::services::dependency_graph::DependencyGraph;
use crate::services::error::EngineError;
use crate::services::field_registry::FieldRegistry;
use crate::services::link_title_updater::LinkTitleUpdater;
use crate::services::ot_channel::{OtChannel, OtOp};
use crate::services::table_registry::TableRegistry;
use chrono::{DateTime, Utc};
use libsql::Connection as LibsqlConnection;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

pub struct RecordStore {
    conn: Connection,
    fields: Arc<FieldRegistry>,
    tables: Arc<TableRegistry>,
    ot: Arc<OtChannel>,
    config: Arc<EngineConfig>,
    dependencies: Arc<DependencyGraph>,
    /// Set once by `TableEngine::open` after `LinkTitleUpdater` exists: that
    /// component already holds an `Arc<RecordStore>` (it writes rewritten
    /// Link cells back through this store), so `RecordStore` can only reach
    /// it via a late-bound, non-owning `Weak` — an `Arc` in both directions
    /// would leak the whole component graph.
    titles: OnceLock<Weak<LinkTitleUpdater>>,
}

/// Per-record outcome of a batch operation (spec §4.5 "per-record success/
/// error list").
#[derive(Debug)]
pub enum BatchOutcome<T> {
    Ok(T),
    Err(EngineError),
}

/// Whether a batch operation stops at the first failure and rolls back
/// everything, or carries on and reports per-item outcomes (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    AllOrNothing,
    BestEffort,
}

impl RecordStore {
    pub fn new(
        conn: Connection,
        fields: Arc<FieldRegistry>,
        tables: Arc<TableRegistry>,
        ot: Arc<OtChannel>,
        config: Arc<EngineConfig>,
        dependencies: Arc<DependencyGraph>,
    ) -> Self {
        Self { conn, fields, tables, ot, config, dependencies, titles: OnceLock::new() }
    }

    /// Late-binds the title-propagation fan-out target. Called exactly once
    /// by `TableEngine::open`, after `LinkTitleUpdater` is constructed.
    pub fn bind_titles(&self, titles: &Arc<LinkTitleUpdater>) {
        let _ = self.titles.set(Arc::downgrade(titles));
    }

    /// Writable fields of a table: every field except the computed ones,
    /// which clients never write directly (spec §3 invariant iv).
    async fn writable_fields(&self, table_id: &str) -> Result<Vec<Field>, EngineError> {
        Ok(self.fields.list(table_id).await?.into_iter().filter(|f| !f.is_computed()).collect())
    }

    #[tracing::instrument(skip(self, data))]
    pub async fn create(
        &self,
        table_id: &str,
        data: HashMap<String, Value>,
        user: &str,
    ) -> Result<Record, EngineError> {
        let table = self.tables.get(table_id).await?;
        let writable = self.writable_fields(table_id).await?;
        let record = Record::new(table_id, data, user);

        let conn = self.conn.connect_with_timeout().await?;
        insert_row(&conn, &table, &writable, &record).await?;

        let changed = record.data.clone();
        self.publish(&record, &changed).await;
        Ok(record)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, table_id: &str, record_id: &str) -> Result<Record, EngineError> {
        let table = self.tables.get(table_id).await?;
        let all_fields = self.fields.list(table_id).await?;
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT * FROM {} WHERE __id = ?", table.physical_table_name()),
                [record_id],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;

        match rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            Some(row) => row_to_record(&row, table_id, &all_fields),
            None => Err(EngineError::RecordNotFound(record_id.to_string())),
        }
    }

    /// Version-checked update (spec §4.5). When `expected_version` is
    /// `Some`, the `WHERE` clause requires `__version = expected_version`;
    /// zero matching rows surfaces `VersionConflict` with the record's
    /// current version.
    #[tracing::instrument(skip(self, data))]
    pub async fn update(
        &self,
        table_id: &str,
        record_id: &str,
        data: HashMap<String, Value>,
        expected_version: Option<i64>,
    ) -> Result<Record, EngineError> {
        let updated = self.update_without_fanout(table_id, record_id, data.clone(), expected_version).await?;
        self.fanout(table_id, &updated, &data).await;
        Ok(updated)
    }

    /// The physical-write half of [`Self::update`], with no fan-out. Used
    /// directly by [`crate::services::link_title_updater::LinkTitleUpdater`]
    /// when it rewrites a cached Link-cell title: that write must not
    /// re-trigger title propagation itself, which would recurse forever
    /// (the title rewrite already *is* the fan-out of an earlier write).
    pub(crate) async fn update_without_fanout(
        &self,
        table_id: &str,
        record_id: &str,
        data: HashMap<String, Value>,
        expected_version: Option<i64>,
    ) -> Result<Record, EngineError> {
        let table = self.tables.get(table_id).await?;
        let writable = self.writable_fields(table_id).await?;

        let mut assignments = vec!["__version = __version + 1".to_string(), "__last_modified_time = ?".to_string()];
        let mut args: Vec<Value> = vec![Value::String(Utc::now().to_rfc3339())];

        for field in &writable {
            if let Some(value) = data.get(&field.id) {
                assignments.push(format!("{} = ?", field.db_field_name));
                args.push(marshal_cell(field, value));
            }
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE __id = ?",
            table.physical_table_name(),
            assignments.join(", "),
        );
        args.push(Value::String(record_id.to_string()));

        if let Some(expected) = expected_version {
            sql.push_str(" AND __version = ?");
            args.push(Value::from(expected));
        }

        let conn = self.conn.connect_with_timeout().await?;
        let changed = conn
            .execute(&sql, to_libsql_params(args))
            .await
            .map_err(|e| crate::db::DbError::sql_execution(format!("record update: {e}")))?;

        if changed == 0 {
            let current = self.get(table_id, record_id).await?;
            return Err(EngineError::VersionConflict { current: current.version });
        }

        let updated = self.get(table_id, record_id).await?;
        self.publish(&updated, &data).await;
        Ok(updated)
    }

    /// Spec §2's write control flow, the part after the physical row is
    /// committed: look up which computed fields depend on what just
    /// changed, then run LinkTitleUpdater's cross-table title propagation
    /// (spec §4.6 invariant 3 — this runs on every write, not only when an
    /// embedder calls `titles.propagate` directly).
    async fn fanout(&self, table_id: &str, updated: &Record, changed: &HashMap<String, Value>) {
        for field_id in changed.keys() {
            match self.dependencies.dependents(table_id, field_id).await {
                Ok(dependents) if !dependents.is_empty() => {
                    // Formula/rollup recompute is not implemented in this
                    // crate (no expression evaluator exists yet); the
                    // dependency lookup still runs so affected fields are
                    // at least visible to an operator via tracing.
                    tracing::debug!(table_id = %table_id, field_id = %field_id, ?dependents, "fields depend on this write; recompute not implemented");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, table_id = %table_id, field_id = %field_id, "dependents lookup failed"),
            }
        }

        if let Some(titles) = self.titles.get().and_then(Weak::upgrade) {
            if let Err(e) = titles.propagate(table_id, &updated.id, &updated.data).await {
                tracing::warn!(error = %e, table_id, record_id = %updated.id, "link title propagation failed");
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, table_id: &str, record_id: &str) -> Result<(), EngineError> {
        let table = self.tables.get(table_id).await?;
        let conn = self.conn.connect_with_timeout().await?;
        let changed = delete_row(&conn, &table, record_id).await?;
        if changed == 0 {
            return Err(EngineError::RecordNotFound(record_id.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(
        &self,
        table_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Record>, i64), EngineError> {
        let table = self.tables.get(table_id).await?;
        let all_fields = self.fields.list(table_id).await?;
        let conn = self.conn.connect_with_timeout().await?;

        let mut count_rows = conn
            .query(&format!("SELECT COUNT(*) FROM {}", table.physical_table_name()), ())
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        let total: i64 = count_rows
            .next()
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?
            .expect("COUNT always returns a row")
            .get(0)
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT * FROM {} ORDER BY __created_time ASC LIMIT ? OFFSET ?",
                    table.physical_table_name()
                ),
                libsql::params![limit, offset],
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            records.push(row_to_record(&row, table_id, &all_fields)?);
        }
        Ok((records, total))
    }

    #[tracing::instrument(skip(self, record_ids))]
    pub async fn find_by_ids(&self, table_id: &str, record_ids: &[String]) -> Result<Vec<Record>, EngineError> {
        let table = self.tables.get(table_id).await?;
        let all_fields = self.fields.list(table_id).await?;
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = record_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let conn = self.conn.connect_with_timeout().await?;
        let mut rows = conn
            .query(
                &format!("SELECT * FROM {} WHERE __id IN ({})", table.physical_table_name(), placeholders),
                record_ids.to_vec(),
            )
            .await
            .map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| crate::db::DbError::sql_execution(e.to_string()))? {
            records.push(row_to_record(&row, table_id, &all_fields)?);
        }
        Ok(records)
    }

    /// Splits `items.len()` into batches per spec §4.5's sizing formula
    /// (clamped to at least 1 so an empty batch never reaches
    /// `slice::chunks`, which panics on a zero chunk size) and runs each
    /// batch as one transaction under `AllOrNothing`, or record-by-record
    /// under `BestEffort` (spec §5).
    pub async fn batch_create(
        &self,
        table_id: &str,
        items: Vec<(HashMap<String, Value>, String)>,
        strategy: BatchStrategy,
    ) -> Vec<BatchOutcome<Record>> {
        if items.is_empty() {
            return Vec::new();
        }
        let batch_size = self.config.batch_size_for(items.len()).max(1);
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(batch_size) {
            let outcomes = match strategy {
                BatchStrategy::BestEffort => {
                    let mut out = Vec::with_capacity(chunk.len());
                    for (data, user) in chunk {
                        out.push(match self.create(table_id, data.clone(), user).await {
                            Ok(record) => BatchOutcome::Ok(record),
                            Err(e) => BatchOutcome::Err(e),
                        });
                    }
                    out
                }
                BatchStrategy::AllOrNothing => self.create_chunk_transactional(table_id, chunk).await,
            };
            let hard_failure =
                strategy == BatchStrategy::AllOrNothing && outcomes.iter().any(|o| matches!(o, BatchOutcome::Err(_)));
            results.extend(outcomes);
            if hard_failure {
                return results;
            }
        }
        results
    }

    /// Writes every record in `chunk` inside a single `BEGIN`/`COMMIT`,
    /// rolling back the whole chunk if any insert fails (spec §5
    /// `AllOrNothing`).
    async fn create_chunk_transactional(
        &self,
        table_id: &str,
        chunk: &[(HashMap<String, Value>, String)],
    ) -> Vec<BatchOutcome<Record>> {
        let table = match self.tables.get(table_id).await {
            Ok(t) => t,
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };
        let writable = match self.writable_fields(table_id).await {
            Ok(w) => w,
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };
        let records: Vec<Record> =
            chunk.iter().map(|(data, user)| Record::new(table_id, data.clone(), user)).collect();

        let txn_result = self
            .conn
            .transaction(|conn| {
                let table = table.clone();
                let writable = writable.clone();
                let records = records.clone();
                async move {
                    for record in &records {
                        insert_row(&conn, &table, &writable, record).await?;
                    }
                    Ok(())
                }
            })
            .await;

        match txn_result {
            Ok(()) => {
                let mut outcomes = Vec::with_capacity(records.len());
                for record in &records {
                    let changed = record.data.clone();
                    self.publish(record, &changed).await;
                    outcomes.push(BatchOutcome::Ok(record.clone()));
                }
                outcomes
            }
            Err(e) => {
                let engine_err: EngineError = e.into();
                chunk.iter().map(|_| BatchOutcome::Err(clone_err(&engine_err))).collect()
            }
        }
    }

    /// Real batch UPDATE (spec §4.5): one `CASE WHEN __id = ? THEN ? ...`
    /// SQL statement per changed field across the whole chunk, plus a
    /// single trailing statement that advances `__version`/
    /// `__last_modified_time` once for the batch — not once per record.
    pub async fn batch_update(
        &self,
        table_id: &str,
        items: Vec<(String, HashMap<String, Value>, Option<i64>)>,
        strategy: BatchStrategy,
    ) -> Vec<BatchOutcome<Record>> {
        if items.is_empty() {
            return Vec::new();
        }
        let batch_size = self.config.batch_size_for(items.len()).max(1);
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(batch_size) {
            let outcomes = self.update_chunk(table_id, chunk, strategy).await;
            let hard_failure =
                strategy == BatchStrategy::AllOrNothing && outcomes.iter().any(|o| matches!(o, BatchOutcome::Err(_)));
            results.extend(outcomes);
            if hard_failure {
                return results;
            }
        }
        results
    }

    async fn update_chunk(
        &self,
        table_id: &str,
        chunk: &[(String, HashMap<String, Value>, Option<i64>)],
        strategy: BatchStrategy,
    ) -> Vec<BatchOutcome<Record>> {
        let table = match self.tables.get(table_id).await {
            Ok(t) => t,
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };
        let writable = match self.writable_fields(table_id).await {
            Ok(w) => w,
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };
        let ids: Vec<String> = chunk.iter().map(|(id, _, _)| id.clone()).collect();
        let current_versions: HashMap<String, i64> = match self.find_by_ids(table_id, &ids).await {
            Ok(records) => records.into_iter().map(|r| (r.id, r.version)).collect(),
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };

        let mut outcomes: Vec<Option<BatchOutcome<Record>>> = (0..chunk.len()).map(|_| None).collect();
        let mut valid: Vec<(usize, String, HashMap<String, Value>)> = Vec::new();
        for (idx, (record_id, data, expected_version)) in chunk.iter().enumerate() {
            let Some(&current) = current_versions.get(record_id) else {
                outcomes[idx] = Some(BatchOutcome::Err(EngineError::RecordNotFound(record_id.clone())));
                continue;
            };
            if let Some(expected) = expected_version {
                if *expected != current {
                    outcomes[idx] = Some(BatchOutcome::Err(EngineError::VersionConflict { current }));
                    continue;
                }
            }
            valid.push((idx, record_id.clone(), data.clone()));
        }

        let any_conflict = outcomes.iter().any(Option::is_some);
        if strategy == BatchStrategy::AllOrNothing && any_conflict {
            return chunk
                .iter()
                .enumerate()
                .map(|(idx, _)| {
                    outcomes[idx].take().unwrap_or_else(|| {
                        BatchOutcome::Err(EngineError::InternalError(
                            "batch rolled back: a sibling update in this batch failed".into(),
                        ))
                    })
                })
                .collect();
        }

        if !valid.is_empty() {
            let to_write: Vec<(String, HashMap<String, Value>)> =
                valid.iter().map(|(_, id, data)| (id.clone(), data.clone())).collect();
            let write_result = self.write_case_when_batch(&table, &writable, &to_write).await;
            match write_result {
                Ok(()) => {
                    for (idx, record_id, data) in &valid {
                        match self.get(table_id, record_id).await {
                            Ok(updated) => {
                                self.publish(&updated, data).await;
                                self.fanout(table_id, &updated, data).await;
                                outcomes[*idx] = Some(BatchOutcome::Ok(updated));
                            }
                            Err(e) => outcomes[*idx] = Some(BatchOutcome::Err(e)),
                        }
                    }
                }
                Err(e) => {
                    for (idx, _, _) in &valid {
                        outcomes[*idx] = Some(BatchOutcome::Err(clone_err(&e)));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| BatchOutcome::Err(EngineError::InternalError("batch item not processed".into()))))
            .collect()
    }

    /// Builds and runs one `UPDATE ... SET field = CASE __id WHEN ? THEN ?
    /// ... ELSE field END` statement per distinct changed field across
    /// `items`, then a single statement advancing `__version`/
    /// `__last_modified_time` for every touched id — all inside one
    /// transaction (spec §4.5 + §5 `AllOrNothing`).
    async fn write_case_when_batch(
        &self,
        table: &crate::models::Table,
        writable: &[Field],
        items: &[(String, HashMap<String, Value>)],
    ) -> Result<(), EngineError> {
        let by_id: HashMap<&str, &Field> = writable.iter().map(|f| (f.id.as_str(), f)).collect();
        let physical = table.physical_table_name();

        let mut field_ids: Vec<String> = Vec::new();
        for (_, data) in items {
            for field_id in data.keys() {
                if by_id.contains_key(field_id.as_str()) && !field_ids.contains(field_id) {
                    field_ids.push(field_id.clone());
                }
            }
        }

        let items = items.to_vec();
        self.conn
            .transaction(|conn| {
                let physical = physical.clone();
                let field_ids = field_ids.clone();
                let by_id_names: HashMap<String, String> =
                    by_id.iter().map(|(id, f)| (id.to_string(), f.db_field_name.clone())).collect();
                let by_id_fields: HashMap<String, Field> =
                    by_id.iter().map(|(id, f)| (id.to_string(), (*f).clone())).collect();
                let items = items.clone();
                async move {
                    for field_id in &field_ids {
                        let db_field_name = &by_id_names[field_id];
                        let field = &by_id_fields[field_id];
                        let mut sql = format!("UPDATE {physical} SET {db_field_name} = CASE __id ");
                        let mut case_args: Vec<Value> = Vec::new();
                        let mut touched_ids: Vec<String> = Vec::new();
                        for (id, data) in &items {
                            if let Some(value) = data.get(field_id) {
                                sql.push_str("WHEN ? THEN ? ");
                                case_args.push(Value::String(id.clone()));
                                case_args.push(marshal_cell(field, value));
                                touched_ids.push(id.clone());
                            }
                        }
                        if touched_ids.is_empty() {
                            continue;
                        }
                        let placeholders = touched_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                        sql.push_str(&format!("ELSE {db_field_name} END WHERE __id IN ({placeholders})"));
                        case_args.extend(touched_ids.into_iter().map(Value::String));
                        conn.execute(&sql, to_libsql_params(case_args))
                            .await
                            .map_err(|e| crate::db::DbError::sql_execution(format!("batch update {field_id}: {e}")))?;
                    }

                    let all_ids: Vec<String> = items.iter().map(|(id, _)| id.clone()).collect();
                    let placeholders = all_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                    let mut args: Vec<Value> = vec![Value::String(Utc::now().to_rfc3339())];
                    args.extend(all_ids.into_iter().map(Value::String));
                    let sql = format!(
                        "UPDATE {physical} SET __version = __version + 1, __last_modified_time = ? WHERE __id IN ({placeholders})"
                    );
                    conn.execute(&sql, to_libsql_params(args))
                        .await
                        .map_err(|e| crate::db::DbError::sql_execution(format!("batch version bump: {e}")))?;
                    Ok(())
                }
            })
            .await
            .map_err(EngineError::from)
    }

    pub async fn batch_delete(
        &self,
        table_id: &str,
        record_ids: Vec<String>,
        strategy: BatchStrategy,
    ) -> Vec<BatchOutcome<()>> {
        if record_ids.is_empty() {
            return Vec::new();
        }
        let batch_size = self.config.batch_size_for(record_ids.len()).max(1);
        let mut results = Vec::with_capacity(record_ids.len());
        for chunk in record_ids.chunks(batch_size) {
            let outcomes = match strategy {
                BatchStrategy::BestEffort => {
                    let mut out = Vec::with_capacity(chunk.len());
                    for record_id in chunk {
                        out.push(match self.delete(table_id, record_id).await {
                            Ok(()) => BatchOutcome::Ok(()),
                            Err(e) => BatchOutcome::Err(e),
                        });
                    }
                    out
                }
                BatchStrategy::AllOrNothing => self.delete_chunk_transactional(table_id, chunk).await,
            };
            let hard_failure =
                strategy == BatchStrategy::AllOrNothing && outcomes.iter().any(|o| matches!(o, BatchOutcome::Err(_)));
            results.extend(outcomes);
            if hard_failure {
                return results;
            }
        }
        results
    }

    async fn delete_chunk_transactional(&self, table_id: &str, chunk: &[String]) -> Vec<BatchOutcome<()>> {
        let table = match self.tables.get(table_id).await {
            Ok(t) => t,
            Err(e) => return chunk.iter().map(|_| BatchOutcome::Err(clone_err(&e))).collect(),
        };
        let ids = chunk.to_vec();

        let txn_result = self
            .conn
            .transaction(|conn| {
                let table = table.clone();
                let ids = ids.clone();
                async move {
                    for id in &ids {
                        delete_row(&conn, &table, id).await?;
                    }
                    Ok(())
                }
            })
            .await;

        match txn_result {
            Ok(()) => chunk.iter().map(|_| BatchOutcome::Ok(())).collect(),
            Err(e) => {
                let engine_err: EngineError = e.into();
                chunk.iter().map(|_| BatchOutcome::Err(clone_err(&engine_err))).collect()
            }
        }
    }

    /// Publishes one OT op carrying one `data.<fieldId>` diff per entry in
    /// `changed` (spec §4.7/§6 — not the whole record, so unrelated fields
    /// never show up in a write's broadcast).
    async fn publish(&self, record: &Record, changed: &HashMap<String, Value>) {
        let op = OtOp::record_changed(record, changed);
        if let Err(e) = self.ot.publish(&format!("rec_{}", record.table_id), &record.id, op).await {
            tracing::warn!(error = %e, record_id = %record.id, "record broadcast failed");
        }
    }
}

/// Builds and runs the `INSERT` for one record against an already-open
/// connection — shared by [`RecordStore::create`] and the transactional
/// `AllOrNothing` batch-create path.
async fn insert_row(
    conn: &LibsqlConnection,
    table: &crate::models::Table,
    writable: &[Field],
    record: &Record,
) -> Result<(), crate::db::DbError> {
    let physical = table.physical_table_name();
    let mut columns = vec!["__id", "__version", "__created_time", "__last_modified_time", "__created_by", "__last_modified_by"];
    let mut placeholders = vec!["?", "?", "?", "?", "?", "?"];
    let mut args: Vec<Value> = vec![
        Value::String(record.id.clone()),
        Value::from(record.version),
        Value::String(record.created_time.to_rfc3339()),
        Value::String(record.last_modified_time.to_rfc3339()),
        Value::String(record.created_by.clone()),
        Value::String(record.last_modified_by.clone()),
    ];

    for field in writable {
        if let Some(value) = record.data.get(&field.id) {
            columns.push(&field.db_field_name);
            placeholders.push("?");
            args.push(marshal_cell(field, value));
        }
    }

    let sql = format!("INSERT INTO {} ({}) VALUES ({})", physical, columns.join(", "), placeholders.join(", "));
    conn.execute(&sql, to_libsql_params(args))
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("record create: {e}")))?;
    Ok(())
}

/// Runs the `DELETE` for one record against an already-open connection —
/// shared by [`RecordStore::delete`] and the transactional `AllOrNothing`
/// batch-delete path.
async fn delete_row(
    conn: &LibsqlConnection,
    table: &crate::models::Table,
    record_id: &str,
) -> Result<u64, crate::db::DbError> {
    conn.execute(&format!("DELETE FROM {} WHERE __id = ?", table.physical_table_name()), [record_id])
        .await
        .map_err(|e| crate::db::DbError::sql_execution(format!("record delete: {e}")))
}

/// `EngineError` doesn't derive `Clone` (it wraps non-Clone error sources in
/// some variants); batch outcomes need to hand the same failure to every
/// item a rolled-back transaction touched, so this rebuilds an equivalent
/// error from the stable parts (`code`/`message`) rather than cloning.
fn clone_err(e: &EngineError) -> EngineError {
    match e {
        EngineError::VersionConflict { current } => EngineError::VersionConflict { current: *current },
        EngineError::RecordNotFound(id) => EngineError::RecordNotFound(id.clone()),
        EngineError::TableNotFound(id) => EngineError::TableNotFound(id.clone()),
        other => EngineError::InternalError(other.to_string()),
    }
}

fn is_jsonb(field: &Field) -> bool {
    matches!(
        field.field_type,
        FieldType::Link | FieldType::MultiSelect | FieldType::Attachment | FieldType::User
    )
}

fn marshal_cell(field: &Field, value: &Value) -> Value {
    if is_jsonb(field) {
        Value::String(value.to_string())
    } else {
        value.clone()
    }
}

/// `libsql::Value` does not carry JSON structure for JSONB-typed columns —
/// they are stored as a JSON-encoded TEXT string and must be re-parsed;
/// every other physical type round-trips directly through `serde_json`'s
/// own number/bool/text representation.
fn unmarshal_value(field: &Field, raw: libsql::Value) -> Value {
    match raw {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(i) => {
            if is_jsonb(field) {
                Value::Null
            } else if field.field_type == FieldType::Checkbox {
                Value::Bool(i != 0)
            } else {
                Value::from(i)
            }
        }
        libsql::Value::Real(f) => Value::from(f),
        libsql::Value::Text(s) => {
            if is_jsonb(field) {
                serde_json::from_str(&s).unwrap_or(Value::Null)
            } else {
                Value::String(s)
            }
        }
        libsql::Value::Blob(_) => Value::Null,
    }
}

/// Reads a row by column name rather than position: physical column order
/// reflects the order fields were added (ALTER TABLE ADD COLUMN), which can
/// diverge from `fields.list`'s `(order, id)` sort once fields are renamed
/// or reordered, so positional indexing into `SELECT *` is not safe here.
fn row_to_record(row: &libsql::Row, table_id: &str, all_fields: &[Field]) -> Result<Record, EngineError> {
    let by_db_name: HashMap<&str, &Field> = all_fields.iter().map(|f| (f.db_field_name.as_str(), f)).collect();

    let id: String = row.get(0).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let version: i64 = row.get(1).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let created_time: String = row.get(2).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let last_modified_time: String = row.get(3).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let created_by: String = row.get(4).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
    let last_modified_by: String = row.get(5).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;

    let mut data = HashMap::new();
    for idx in 6..row.column_count() {
        let Some(col_name) = row.column_name(idx) else { continue };
        let Some(field) = by_db_name.get(col_name) else { continue };
        let raw = row.get_value(idx).map_err(|e| crate::db::DbError::sql_execution(e.to_string()))?;
        if !matches!(raw, libsql::Value::Null) {
            data.insert(field.id.clone(), unmarshal_value(field, raw));
        }
    }

    Ok(Record {
        id,
        table_id: table_id.to_string(),
        data,
        version,
        created_time: created_time.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        last_modified_time: last_modified_time.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        created_by,
        last_modified_by,
    })
}

fn to_libsql_params(values: Vec<Value>) -> Vec<libsql::Value> {
    values.into_iter().map(value_to_libsql).collect()
}

fn value_to_libsql(value: Value) -> libsql::Value {
    match value {
        Value::Null => libsql::Value::Null,
        Value::Bool(b) => libsql::Value::Integer(b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                libsql::Value::Integer(i)
            } else {
                libsql::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => libsql::Value::Text(s),
        other => libsql::Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::{Connection, SqliteDialect};
    use crate::models::{CommonOptions, FieldOptions, Table};
    use crate::schema::SchemaProvider;
    use crate::services::field_registry::FieldCreateRequest;
    use serde_json::json;

    async fn harness() -> (RecordStore, Arc<FieldRegistry>, Table) {
        let conn = Connection::open(&EngineConfig::in_memory()).await.unwrap();
        let schema = Arc::new(SchemaProvider::new(conn.clone(), Arc::new(SqliteDialect)));
        let ot = Arc::new(OtChannel::new());
        let tables = Arc::new(TableRegistry::new(conn.clone()));
        tables.ensure_meta_table().await.unwrap();
        let fields = Arc::new(FieldRegistry::new(conn.clone(), schema.clone(), ot.clone(), tables.clone()));
        fields.ensure_meta_table().await.unwrap();

        let table = Table::new("base_1", "People");
        schema.create_physical_table(&table).await.unwrap();
        tables.create(&table).await.unwrap();

        fields
            .create(
                &table,
                FieldCreateRequest {
                    name: "Name".into(),
                    description: None,
                    field_type: FieldType::ShortText,
                    options: FieldOptions::Plain(CommonOptions::default()),
                    required: false,
                    unique: false,
                    is_primary: true,
                },
                "u1",
            )
            .await
            .unwrap();

        let config = Arc::new(EngineConfig::in_memory());
        let dependencies = Arc::new(DependencyGraph::new(fields.clone(), std::time::Duration::from_secs(60)));
        let store = RecordStore::new(conn, fields.clone(), tables, ot, config, dependencies);
        (store, fields, table)
    }

    #[tokio::test]
    async fn create_then_get_round_trips_data() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);
        let mut data = HashMap::new();
        data.insert(name_field.id.clone(), json!("Ada"));
        let created = store.create(&table.id, data, "u1").await.unwrap();

        let fetched = store.get(&table.id, &created.id).await.unwrap();
        assert_eq!(fetched.data.get(&name_field.id), Some(&json!("Ada")));
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn update_with_stale_version_is_rejected() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);
        let mut data = HashMap::new();
        data.insert(name_field.id.clone(), json!("Ada"));
        let created = store.create(&table.id, data, "u1").await.unwrap();

        let mut update = HashMap::new();
        update.insert(name_field.id.clone(), json!("Grace"));
        let err = store.update(&table.id, &created.id, update, Some(99)).await.unwrap_err();
        assert!(matches!(err, EngineError::VersionConflict { current: 1 }));
    }

    #[tokio::test]
    async fn update_advances_version() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);
        let mut data = HashMap::new();
        data.insert(name_field.id.clone(), json!("Ada"));
        let created = store.create(&table.id, data, "u1").await.unwrap();

        let mut update = HashMap::new();
        update.insert(name_field.id.clone(), json!("Grace"));
        let updated = store.update(&table.id, &created.id, update, None).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.data.get(&name_field.id), Some(&json!("Grace")));
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);
        let mut data = HashMap::new();
        data.insert(name_field.id.clone(), json!("Ada"));
        let created = store.create(&table.id, data, "u1").await.unwrap();

        store.delete(&table.id, &created.id).await.unwrap();
        let err = store.get(&table.id, &created.id).await.unwrap_err();
        assert!(matches!(err, EngineError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn batch_create_with_empty_items_returns_empty_without_panicking() {
        let (store, _fields, table) = harness().await;
        let outcomes = store.batch_create(&table.id, vec![], BatchStrategy::BestEffort).await;
        assert!(outcomes.is_empty());
        let outcomes = store.batch_create(&table.id, vec![], BatchStrategy::AllOrNothing).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn batch_update_with_empty_items_returns_empty_without_panicking() {
        let (store, _fields, table) = harness().await;
        let outcomes = store.batch_update(&table.id, vec![], BatchStrategy::AllOrNothing).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn batch_delete_with_empty_items_returns_empty_without_panicking() {
        let (store, _fields, table) = harness().await;
        let outcomes = store.batch_delete(&table.id, vec![], BatchStrategy::AllOrNothing).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn batch_update_all_or_nothing_rolls_back_whole_chunk_on_conflict() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);

        let mut data_a = HashMap::new();
        data_a.insert(name_field.id.clone(), json!("Ada"));
        let a = store.create(&table.id, data_a, "u1").await.unwrap();

        let mut data_b = HashMap::new();
        data_b.insert(name_field.id.clone(), json!("Grace"));
        let b = store.create(&table.id, data_b, "u1").await.unwrap();

        let mut edit_a = HashMap::new();
        edit_a.insert(name_field.id.clone(), json!("Ada Lovelace"));
        let mut edit_b = HashMap::new();
        edit_b.insert(name_field.id.clone(), json!("Grace Hopper"));

        // `b`'s expected_version is stale, so the whole AllOrNothing batch
        // must be rejected and `a` must be left untouched too.
        let outcomes = store
            .batch_update(
                &table.id,
                vec![(a.id.clone(), edit_a, Some(a.version)), (b.id.clone(), edit_b, Some(99))],
                BatchStrategy::AllOrNothing,
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, BatchOutcome::Err(_))));

        let a_after = store.get(&table.id, &a.id).await.unwrap();
        let b_after = store.get(&table.id, &b.id).await.unwrap();
        assert_eq!(a_after.data.get(&name_field.id), Some(&json!("Ada")));
        assert_eq!(a_after.version, 1);
        assert_eq!(b_after.data.get(&name_field.id), Some(&json!("Grace")));
        assert_eq!(b_after.version, 1);
    }

    #[tokio::test]
    async fn batch_update_case_when_writes_distinct_values_and_bumps_version_once() {
        let (store, fields, table) = harness().await;
        let name_field = fields.list(&table.id).await.unwrap().remove(0);

        let mut data_a = HashMap::new();
        data_a.insert(name_field.id.clone(), json!("Ada"));
        let a = store.create(&table.id, data_a, "u1").await.unwrap();

        let mut data_b = HashMap::new();
        data_b.insert(name_field.id.clone(), json!("Grace"));
        let b = store.create(&table.id, data_b, "u1").await.unwrap();

        let mut edit_a = HashMap::new();
        edit_a.insert(name_field.id.clone(), json!("Ada Lovelace"));
        let mut edit_b = HashMap::new();
        edit_b.insert(name_field.id.clone(), json!("Grace Hopper"));

        let outcomes = store
            .batch_update(&table.id, vec![(a.id.clone(), edit_a, None), (b.id.clone(), edit_b, None)], BatchStrategy::AllOrNothing)
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o, BatchOutcome::Ok(_))));

        let a_after = store.get(&table.id, &a.id).await.unwrap();
        let b_after = store.get(&table.id, &b.id).await.unwrap();
        assert_eq!(a_after.data.get(&name_field.id), Some(&json!("Ada Lovelace")));
        assert_eq!(b_after.data.get(&name_field.id), Some(&json!("Grace Hopper")));
        assert_eq!(a_after.version, 2);
        assert_eq!(b_after.version, 2);
    }
}
