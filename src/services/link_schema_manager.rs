//! LinkSchemaManager (spec §4.3, component C3)
//!
//! Derives the physical layout of Link fields (junction table vs FK column),
//! wires up symmetric reverse fields, and migrates relationship types in
//! place. Grounded on `services/schema_table_manager.rs`'s DDL helpers (for
//! junction-table creation) composed with `FieldRegistry` for metadata, the
//! same split the teacher uses between schema DDL and node/record metadata.

use crate::models::{Field, FieldOptions, FieldType, LinkOptions, Relationship, Table};
use crate::schema::SchemaProvider;
use crate::services::error::EngineError;
use crate::services::field_registry::{FieldCreateRequest, FieldPatch, FieldRegistry};
use crate::services::record_store::RecordStore;
use crate::services::table_registry::TableRegistry;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub struct LinkSchemaManager {
    fields: Arc<FieldRegistry>,
    tables: Arc<TableRegistry>,
    schema: Arc<SchemaProvider>,
    records: Arc<RecordStore>,
}

impl LinkSchemaManager {
    pub fn new(
        fields: Arc<FieldRegistry>,
        tables: Arc<TableRegistry>,
        schema: Arc<SchemaProvider>,
        records: Arc<RecordStore>,
    ) -> Self {
        Self { fields, tables, schema, records }
    }

    /// Auto-resolves `lookup_field_id` to the first non-virtual field of the
    /// foreign table, ordered `(order asc, id asc)` (spec §4.3 rule 1 /
    /// §9 Open Question: tie-break recommendation). Falls back to the first
    /// field with a non-empty id if every field is virtual.
    pub async fn resolve_lookup_field(&self, foreign_table_id: &str) -> Result<Option<String>, EngineError> {
        let mut candidates = self.fields.list(foreign_table_id).await?;
        candidates.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        if let Some(field) = candidates.iter().find(|f| !f.field_type.is_virtual()) {
            return Ok(Some(field.id.clone()));
        }
        Ok(candidates.into_iter().find(|f| !f.id.is_empty()).map(|f| f.id))
    }

    /// Derives `fk_host_table_name`/`self_key_name`/`foreign_key_name` from
    /// `(currentTable, foreignTable, relationship, dbFieldName)` per spec
    /// §4.3 rule 1, and materializes the physical layout (junction table or
    /// host-table column).
    #[tracing::instrument(skip(self, current_table, foreign_table))]
    async fn derive_layout(
        &self,
        current_table: &Table,
        foreign_table: &Table,
        relationship: Relationship,
        db_field_name: &str,
    ) -> Result<(String, String, String), EngineError> {
        let (fk_host, self_key, foreign_key) = match relationship {
            Relationship::ManyMany => (
                format!("link_{}_{}", current_table.id, foreign_table.id),
                format!("{}_id", current_table.id),
                format!("{}_id", foreign_table.id),
            ),
            Relationship::ManyOne | Relationship::OneOne => {
                (current_table.id.clone(), "__id".to_string(), db_field_name.to_string())
            }
            Relationship::OneMany => {
                (foreign_table.id.clone(), "__id".to_string(), "__id".to_string())
            }
        };

        if relationship == Relationship::ManyMany {
            self.create_junction_table(&fk_host, current_table, foreign_table).await?;
        }

        Ok((fk_host, self_key, foreign_key))
    }

    async fn create_junction_table(&self, junction_name: &str, a: &Table, b: &Table) -> Result<(), EngineError> {
        self.schema.create_junction_table(junction_name, &format!("{}_id", a.id), &format!("{}_id", b.id)).await?;
        Ok(())
    }

    /// Creates a Link field: derives its physical layout, persists metadata
    /// via `FieldRegistry::create_metadata`, adds the host-table column for
    /// non-junction layouts, then (if `is_symmetric`) creates the reverse
    /// field (spec §4.3 rules 1-2).
    #[tracing::instrument(skip(self, table, req), fields(table_id = %table.id))]
    pub async fn create_link_field(
        &self,
        table: &Table,
        mut req: FieldCreateRequest,
        user: &str,
    ) -> Result<Field, EngineError> {
        let mut opts = match &req.options {
            FieldOptions::Link(o) => o.clone(),
            _ => return Err(EngineError::InvalidOption("link field requires Link options".into())),
        };

        let foreign_table = self.tables.get(&opts.foreign_table_id).await?;

        if opts.lookup_field_id.is_none() {
            opts.lookup_field_id = self.resolve_lookup_field(&foreign_table.id).await?;
        }

        let field_id = crate::ids::field_id();
        let db_field_name = self.fields.generate_db_field_name(&table.id, &req.name).await?;
        let (fk_host, self_key, foreign_key) =
            self.derive_layout(table, &foreign_table, opts.relationship, &db_field_name).await?;
        opts.fk_host_table_name = fk_host;
        opts.self_key_name = self_key;
        opts.foreign_key_name = foreign_key;

        req.options = FieldOptions::Link(opts.clone());
        let order = self.fields.next_order_for(&table.id).await?;
        let db_field_type = self.schema.map_field_type(&Field {
            id: field_id.clone(),
            table_id: table.id.clone(),
            name: req.name.clone(),
            description: req.description.clone(),
            field_type: FieldType::Link,
            options: req.options.clone(),
            db_field_name: db_field_name.clone(),
            db_field_type: String::new(),
            order,
            required: req.required,
            unique: req.unique,
            is_primary: false,
        }).physical_type;

        let field = Field {
            id: field_id,
            table_id: table.id.clone(),
            name: req.name,
            description: req.description,
            field_type: FieldType::Link,
            options: FieldOptions::Link(opts.clone()),
            db_field_name,
            db_field_type,
            order,
            required: req.required,
            unique: req.unique,
            is_primary: false,
        };

        let saved = self.fields.create_metadata(table, field, user).await?;

        if opts.relationship != Relationship::ManyMany && opts.relationship != Relationship::OneMany {
            self.schema.add_column(table, &saved).await?;
        }

        if opts.is_symmetric && opts.symmetric_field_id.is_none() {
            self.create_symmetric_field(table, &foreign_table, &saved, user).await;
        }

        Ok(saved)
    }

    /// Best-effort: failures here degrade to an empty `symmetric_field_id`
    /// on the main field rather than rolling back its creation (spec §4.3
    /// rule 2 — "this is an acceptable degraded state, not a hard rollback").
    async fn create_symmetric_field(&self, current_table: &Table, foreign_table: &Table, main: &Field, user: &str) {
        let result = self.create_reverse_field(current_table, foreign_table, main, user).await;
        match result {
            Ok(reverse) => {
                let patch = FieldPatch {
                    options: Some(patch_symmetric(&main.options, &reverse.id)),
                    ..Default::default()
                };
                if let Err(e) = self.fields.update(&main.id, patch).await {
                    tracing::warn!(error = %e, field_id = %main.id, "failed to patch symmetric_field_id");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, field_id = %main.id, "symmetric field creation failed; leaving degraded");
            }
        }
    }

    async fn create_reverse_field(
        &self,
        current_table: &Table,
        foreign_table: &Table,
        main: &Field,
        user: &str,
    ) -> Result<Field, EngineError> {
        let main_opts = main.options.as_link().expect("main is a link field");
        let reverse_relationship = main_opts.relationship.reverse();

        let existing_names: Vec<String> =
            self.fields.list(&foreign_table.id).await?.into_iter().map(|f| f.name).collect();
        let mut name = current_table.name.clone();
        let mut n = 2;
        while existing_names.contains(&name) {
            name = format!("{} {}", current_table.name, n);
            n += 1;
        }

        let reverse_options = LinkOptions {
            foreign_table_id: current_table.id.clone(),
            relationship: reverse_relationship,
            lookup_field_id: None,
            fk_host_table_name: String::new(),
            self_key_name: String::new(),
            foreign_key_name: String::new(),
            is_symmetric: true,
            symmetric_field_id: Some(main.id.clone()),
            allow_multiple: matches!(reverse_relationship, Relationship::OneMany | Relationship::ManyMany),
        };

        let req = FieldCreateRequest {
            name,
            description: None,
            field_type: FieldType::Link,
            options: FieldOptions::Link(reverse_options),
            required: false,
            unique: false,
            is_primary: false,
        };

        Box::pin(self.create_link_field(foreign_table, req, user)).await
    }

    /// Relationship-type migration (spec §4.3 rule 3): data-preserving where
    /// possible, `MigrationConflict` otherwise.
    #[tracing::instrument(skip(self, table, field))]
    pub async fn migrate_relationship(
        &self,
        table: &Table,
        field: &Field,
        new_relationship: Relationship,
    ) -> Result<Field, EngineError> {
        let opts = field.options.as_link().ok_or_else(|| {
            EngineError::InvalidOption("migrate_relationship called on a non-link field".into())
        })?;
        let old = opts.relationship;
        if old == new_relationship {
            return Ok(field.clone());
        }

        let foreign_table = self.tables.get(&opts.foreign_table_id).await?;

        if old == Relationship::ManyMany && new_relationship != Relationship::ManyMany {
            let row_count = self.schema.junction_row_count(&opts.fk_host_table_name).await?;
            let side_count = self.schema.junction_distinct_sides(&opts.fk_host_table_name, &format!("{}_id", table.id)).await?;
            if new_relationship != Relationship::ManyMany && row_count > side_count {
                return Err(EngineError::MigrationConflict(
                    "manyMany -> singular relationship requires at most one row per side".into(),
                ));
            }
        }

        let (fk_host, self_key, foreign_key) =
            self.derive_layout(table, &foreign_table, new_relationship, &field.db_field_name).await?;

        let mut new_opts = opts.clone();
        new_opts.relationship = new_relationship;
        new_opts.fk_host_table_name = fk_host;
        new_opts.self_key_name = self_key;
        new_opts.foreign_key_name = foreign_key;

        if old != Relationship::ManyMany && new_relationship != Relationship::ManyMany {
            match (owns_physical_column(old), owns_physical_column(new_relationship)) {
                (true, true) => {
                    // Same host table, same column name: no physical change
                    // and no data movement needed.
                }
                (true, false) => {
                    self.transfer_ownership_to_symmetric(table, field, &foreign_table, opts).await?;
                }
                (false, true) => {
                    self.transfer_ownership_from_symmetric(table, field, &foreign_table, opts).await?;
                }
                (false, false) => {}
            }
        }

        let updated = self.fields.update(
            &field.id,
            FieldPatch { options: Some(FieldOptions::Link(new_opts)), ..Default::default() },
        )
        .await?;

        if let Some(symmetric_id) = opts.symmetric_field_id.clone() {
            if let Ok(symmetric) = self.fields.get(&symmetric_id).await {
                let symmetric_new_relationship = new_relationship.reverse();
                let (sym_fk_host, sym_self_key, sym_foreign_key) = self
                    .derive_layout(&foreign_table, table, symmetric_new_relationship, &symmetric.db_field_name)
                    .await
                    .unwrap_or((
                        symmetric.options.as_link().map(|o| o.fk_host_table_name.clone()).unwrap_or_default(),
                        symmetric.options.as_link().map(|o| o.self_key_name.clone()).unwrap_or_default(),
                        symmetric.options.as_link().map(|o| o.foreign_key_name.clone()).unwrap_or_default(),
                    ));
                let reversed = FieldPatch {
                    options: Some(patch_layout(
                        &symmetric.options,
                        symmetric_new_relationship,
                        &sym_fk_host,
                        &sym_self_key,
                        &sym_foreign_key,
                    )),
                    ..Default::default()
                };
                if let Err(e) = self.fields.update(&symmetric_id, reversed).await {
                    tracing::warn!(error = %e, "failed to update symmetric side of migrated relationship");
                }
            }
        }

        Ok(updated)
    }

    /// `manyOne`/`oneOne` (owns a column on `table`) -> `oneMany` (virtual):
    /// this field stops owning a column. If a symmetric field exists, its
    /// data becomes the new source of truth, inverted record-by-record and
    /// written into a freshly added column on `foreign_table` (spec §8
    /// scenario 6 — "FK column dropped from A, FK column added to B, data
    /// moved one-for-one").
    async fn transfer_ownership_to_symmetric(
        &self,
        table: &Table,
        field: &Field,
        foreign_table: &Table,
        opts: &LinkOptions,
    ) -> Result<(), EngineError> {
        let Some(symmetric_id) = opts.symmetric_field_id.clone() else {
            self.schema.drop_column(table, &field.db_field_name).await.ok();
            return Ok(());
        };
        let symmetric = self.fields.get(&symmetric_id).await?;
        self.schema.add_column(foreign_table, &symmetric).await.ok();

        let lookup_field_id = self.resolve_lookup_field(&table.id).await?;
        let (records, _) = self.records.list(&table.id, i64::MAX, 0).await?;

        for record in records {
            let Some(cell) = record.data.get(&field.id) else { continue };
            let Some(target_id) = cell.get("id").and_then(Value::as_str) else { continue };
            let title = title_for(&record.data, lookup_field_id.as_deref());
            let inverted = json!({ "id": record.id, "title": title });
            self.records
                .update(&foreign_table.id, target_id, HashMap::from([(symmetric.id.clone(), inverted)]), None)
                .await
                .ok();
        }

        self.schema.drop_column(table, &field.db_field_name).await.ok();
        Ok(())
    }

    /// Inverse of [`Self::transfer_ownership_to_symmetric`]: `oneMany`
    /// (virtual) -> `manyOne`/`oneOne` (owns a column on `table`). Data is
    /// pulled back out of the symmetric field's column on `foreign_table`.
    async fn transfer_ownership_from_symmetric(
        &self,
        table: &Table,
        field: &Field,
        foreign_table: &Table,
        opts: &LinkOptions,
    ) -> Result<(), EngineError> {
        self.schema.add_column(table, field).await.ok();

        let Some(symmetric_id) = opts.symmetric_field_id.clone() else { return Ok(()) };
        let symmetric = self.fields.get(&symmetric_id).await?;

        let lookup_field_id = self.resolve_lookup_field(&foreign_table.id).await?;
        let (records, _) = self.records.list(&foreign_table.id, i64::MAX, 0).await?;

        for record in records {
            let Some(cell) = record.data.get(&symmetric.id) else { continue };
            let Some(target_id) = cell.get("id").and_then(Value::as_str) else { continue };
            let title = title_for(&record.data, lookup_field_id.as_deref());
            let inverted = json!({ "id": record.id, "title": title });
            self.records.update(&table.id, target_id, HashMap::from([(field.id.clone(), inverted)]), None).await.ok();
        }

        self.schema.drop_column(foreign_table, &symmetric.db_field_name).await.ok();
        Ok(())
    }

    /// Delete cascade (spec §4.3 rule 4): drops the symmetric field
    /// (best-effort) and any junction table the deleted field owned.
    #[tracing::instrument(skip(self, table, field))]
    pub async fn delete_link_field(&self, table: &Table, field: &Field) -> Result<(), EngineError> {
        let opts = field.options.as_link().ok_or_else(|| {
            EngineError::InvalidOption("delete_link_field called on a non-link field".into())
        })?;

        if opts.relationship == Relationship::ManyMany {
            self.schema.drop_junction_table(&opts.fk_host_table_name).await.ok();
        } else if matches!(opts.relationship, Relationship::ManyOne | Relationship::OneOne) {
            self.schema.drop_column(table, &field.db_field_name).await.ok();
        }

        if let Some(symmetric_id) = &opts.symmetric_field_id {
            if let Ok(symmetric) = self.fields.get(symmetric_id).await {
                if let Err(e) = self.fields.delete(&symmetric.id).await {
                    tracing::warn!(error = %e, field_id = %symmetric.id, "best-effort symmetric field delete failed");
                }
            }
        }

        self.fields.delete(&field.id).await?;
        Ok(())
    }
}

fn patch_symmetric(options: &FieldOptions, symmetric_field_id: &str) -> FieldOptions {
    let mut opts = options.as_link().cloned().expect("link options");
    opts.symmetric_field_id = Some(symmetric_field_id.to_string());
    FieldOptions::Link(opts)
}

fn patch_layout(
    options: &FieldOptions,
    relationship: Relationship,
    fk_host_table_name: &str,
    self_key_name: &str,
    foreign_key_name: &str,
) -> FieldOptions {
    let mut opts = options.as_link().cloned().expect("link options");
    opts.relationship = relationship;
    opts.fk_host_table_name = fk_host_table_name.to_string();
    opts.self_key_name = self_key_name.to_string();
    opts.foreign_key_name = foreign_key_name.to_string();
    FieldOptions::Link(opts)
}

/// `manyOne`/`oneOne` own a real physical column on the current table;
/// `oneMany` is virtual (its data lives in the symmetric `manyOne` field's
/// column); `manyMany` is handled separately via a junction table.
fn owns_physical_column(relationship: Relationship) -> bool {
    matches!(relationship, Relationship::ManyOne | Relationship::OneOne)
}

fn title_for(data: &HashMap<String, Value>, lookup_field_id: Option<&str>) -> Option<String> {
    lookup_field_id.and_then(|id| data.get(id)).and_then(|v| v.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::{Connection, SqliteDialect};
    use crate::models::CommonOptions;
    use crate::services::ot_channel::OtChannel;

    async fn harness() -> (LinkSchemaManager, Arc<FieldRegistry>, Arc<TableRegistry>, Arc<RecordStore>, Table, Table)
    {
        let conn = Connection::open(&EngineConfig::in_memory()).await.unwrap();
        let schema = Arc::new(SchemaProvider::new(conn.clone(), Arc::new(SqliteDialect)));
        let ot = Arc::new(OtChannel::new());
        let tables = Arc::new(TableRegistry::new(conn.clone()));
        tables.ensure_meta_table().await.unwrap();
        let fields = Arc::new(FieldRegistry::new(conn.clone(), schema.clone(), ot.clone(), tables.clone()));
        fields.ensure_meta_table().await.unwrap();
        let dependencies = Arc::new(crate::services::dependency_graph::DependencyGraph::new(
            fields.clone(),
            std::time::Duration::from_secs(60),
        ));
        let records = Arc::new(RecordStore::new(
            conn,
            fields.clone(),
            tables.clone(),
            ot,
            Arc::new(EngineConfig::in_memory()),
            dependencies,
        ));

        let table_a = Table::new("base_1", "People");
        let table_b = Table::new("base_1", "Companies");
        schema.create_physical_table(&table_a).await.unwrap();
        schema.create_physical_table(&table_b).await.unwrap();
        tables.create(&table_a).await.unwrap();
        tables.create(&table_b).await.unwrap();

        fields.create(&table_b, plain_request("Name"), "u1").await.unwrap();

        (
            LinkSchemaManager::new(fields.clone(), tables.clone(), schema, records.clone()),
            fields,
            tables,
            records,
            table_a,
            table_b,
        )
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

    fn link_request(name: &str, foreign_table_id: &str, relationship: Relationship, symmetric: bool) -> FieldCreateRequest {
        FieldCreateRequest {
            name: name.to_string(),
            description: None,
            field_type: FieldType::Link,
            options: FieldOptions::Link(LinkOptions {
                foreign_table_id: foreign_table_id.to_string(),
                relationship,
                lookup_field_id: None,
                fk_host_table_name: String::new(),
                self_key_name: String::new(),
                foreign_key_name: String::new(),
                is_symmetric: symmetric,
                symmetric_field_id: None,
                allow_multiple: false,
            }),
            required: false,
            unique: false,
            is_primary: false,
        }
    }

    #[tokio::test]
    async fn create_link_auto_resolves_lookup_field() {
        let (manager, fields, _tables, _records, table_a, table_b) = harness().await;
        let saved = manager
            .create_link_field(&table_a, link_request("Employer", &table_b.id, Relationship::ManyOne, false), "u1")
            .await
            .unwrap();

        let opts = saved.options.as_link().unwrap();
        let name_field = fields.get_by_names(&table_b.id, &["Name".to_string()]).await.unwrap();
        assert_eq!(opts.lookup_field_id.as_deref(), Some(name_field[0].id.as_str()));
        assert_eq!(opts.foreign_key_name, saved.db_field_name);
    }

    #[tokio::test]
    async fn symmetric_many_many_creates_junction_and_reverse_field() {
        let (manager, fields, _tables, _records, table_a, table_b) = harness().await;
        let saved = manager
            .create_link_field(&table_a, link_request("Owns", &table_b.id, Relationship::ManyMany, true), "u1")
            .await
            .unwrap();

        let main = fields.get(&saved.id).await.unwrap();
        let main_opts = main.options.as_link().unwrap();
        assert!(main_opts.symmetric_field_id.is_some());

        let reverse_fields = fields.list(&table_b.id).await.unwrap();
        let reverse = reverse_fields.iter().find(|f| f.field_type == FieldType::Link).unwrap();
        let reverse_opts = reverse.options.as_link().unwrap();
        assert_eq!(reverse_opts.relationship, Relationship::ManyMany);
        assert_eq!(reverse_opts.symmetric_field_id.as_deref(), Some(main.id.as_str()));
    }

    #[tokio::test]
    async fn migrating_many_one_to_one_many_moves_data_onto_the_symmetric_field() {
        let (manager, fields, _tables, records, table_a, table_b) = harness().await;

        let saved = manager
            .create_link_field(&table_a, link_request("Employer", &table_b.id, Relationship::ManyOne, true), "u1")
            .await
            .unwrap();
        let main = fields.get(&saved.id).await.unwrap();
        let symmetric_id = main.options.as_link().unwrap().symmetric_field_id.clone().unwrap();

        let mut b_data = HashMap::new();
        b_data.insert(
            fields.get_by_names(&table_b.id, &["Name".to_string()]).await.unwrap()[0].id.clone(),
            json!("Acme"),
        );
        let b_record = records.create(&table_b.id, b_data, "u1").await.unwrap();

        let mut a_data = HashMap::new();
        a_data.insert(main.id.clone(), json!({ "id": b_record.id, "title": "Acme" }));
        let a_record = records.create(&table_a.id, a_data, "u1").await.unwrap();

        let migrated = manager.migrate_relationship(&table_a, &main, Relationship::OneMany).await.unwrap();
        assert_eq!(migrated.options.as_link().unwrap().relationship, Relationship::OneMany);

        // Data moved onto the symmetric field on B, pointing back at A's row.
        let b_after = records.get(&table_b.id, &b_record.id).await.unwrap();
        let moved = b_after.data.get(&symmetric_id).unwrap();
        assert_eq!(moved.get("id").and_then(Value::as_str), Some(a_record.id.as_str()));

        // A's own column for the migrated field no longer carries the cell.
        let a_after = records.get(&table_a.id, &a_record.id).await.unwrap();
        assert!(!a_after.data.contains_key(&main.id));

        let symmetric = fields.get(&symmetric_id).await.unwrap();
        assert_eq!(symmetric.options.as_link().unwrap().relationship, Relationship::ManyOne);
    }
}
