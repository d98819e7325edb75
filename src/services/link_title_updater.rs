//! LinkTitleUpdater (spec §4.6, component C6)
//!
//! Keeps every Link cell's cached `title` in sync with the foreign record's
//! lookup field after a write, fanning out across tables — grounded on
//! `services/relationship_cache.rs`'s cross-table invalidation sweep, here
//! driving direct JSONB cell rewrites instead of cache eviction.

use crate::services::error::EngineError;
use crate::services::field_registry::FieldRegistry;
use crate::services::link_schema_manager::LinkSchemaManager;
use crate::services::record_store::RecordStore;
use crate::services::table_registry::TableRegistry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub struct LinkTitleUpdater {
    fields: Arc<FieldRegistry>,
    tables: Arc<TableRegistry>,
    records: Arc<RecordStore>,
    links: Arc<LinkSchemaManager>,
}

impl LinkTitleUpdater {
    pub fn new(
        fields: Arc<FieldRegistry>,
        tables: Arc<TableRegistry>,
        records: Arc<RecordStore>,
        links: Arc<LinkSchemaManager>,
    ) -> Self {
        Self { fields, tables, records, links }
    }

    /// Given a freshly-written source record, propagates its new title to
    /// every Link cell across the base that references it (spec §4.6).
    /// Per-table failures are logged and skipped; the triggering write is
    /// never failed by this fan-out (spec §4.6 "Failure policy").
    #[tracing::instrument(skip(self, new_source_data))]
    pub async fn propagate(
        &self,
        source_table_id: &str,
        source_record_id: &str,
        new_source_data: &HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        let affected_links = self.fields.list_links_to_table(source_table_id).await?;

        for link_field in affected_links {
            let lookup_field_id = match link_field.options.as_link().and_then(|o| o.lookup_field_id.clone()) {
                Some(id) => id,
                None => match self.links.resolve_lookup_field(source_table_id).await {
                    Ok(Some(id)) => id,
                    _ => continue,
                },
            };

            // Field-name keying wins over field-id keying when both are
            // present (spec §4.6 step 2 — "the fresher client-submitted
            // value").
            let new_title = match self.fields.get(&lookup_field_id).await {
                Ok(lookup_field) => new_source_data
                    .get(&lookup_field.name)
                    .or_else(|| new_source_data.get(&lookup_field_id))
                    .and_then(value_as_title),
                Err(_) => continue,
            };

            if let Err(e) = self
                .rewrite_table(&link_field.table_id, &link_field.id, source_record_id, new_title.as_deref())
                .await
            {
                tracing::warn!(
                    error = %e,
                    table_id = %link_field.table_id,
                    field_id = %link_field.id,
                    "link title propagation failed for table; skipping"
                );
            }
        }

        Ok(())
    }

    async fn rewrite_table(
        &self,
        table_id: &str,
        field_id: &str,
        source_record_id: &str,
        new_title: Option<&str>,
    ) -> Result<(), EngineError> {
        let table = self.tables.get(table_id).await?;
        let (records, _total) = self.records.list(table_id, i64::MAX, 0).await?;

        for record in records {
            let Some(cell) = record.data.get(field_id) else { continue };
            let rewritten = rewrite_link_cell(cell, source_record_id, new_title);
            let Some(rewritten) = rewritten else { continue };

            let mut patch = HashMap::new();
            patch.insert(field_id.to_string(), rewritten);
            // Goes through the no-fanout path: this write already *is* the
            // fan-out of an earlier title change, so it must not trigger
            // another round of propagation. It still publishes a
            // `data.<fieldId>` diff for exactly this field (spec §8
            // scenario 3).
            self.records.update_without_fanout(&table.id, &record.id, patch, None).await?;
        }
        Ok(())
    }
}

fn value_as_title(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Rewrites the `title` of every Link cell referencing `source_record_id`,
/// leaving cells referencing other records untouched. Returns `None` if the
/// cell doesn't reference `source_record_id` at all (no-op).
fn rewrite_link_cell(cell: &Value, source_record_id: &str, new_title: Option<&str>) -> Option<Value> {
    match cell {
        Value::Object(obj) => {
            if obj.get("id").and_then(|v| v.as_str()) == Some(source_record_id) {
                let mut obj = obj.clone();
                obj.insert("title".to_string(), new_title.map(Value::from).unwrap_or(Value::Null));
                Some(Value::Object(obj))
            } else {
                None
            }
        }
        Value::Array(items) => {
            let mut changed = false;
            let rewritten: Vec<Value> = items
                .iter()
                .map(|item| match item.as_object() {
                    Some(obj) if obj.get("id").and_then(|v| v.as_str()) == Some(source_record_id) => {
                        changed = true;
                        let mut obj = obj.clone();
                        obj.insert("title".to_string(), new_title.map(Value::from).unwrap_or(Value::Null));
                        Value::Object(obj)
                    }
                    _ => item.clone(),
                })
                .collect();
            changed.then_some(Value::Array(rewritten))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_object_shaped_cell_referencing_source_record() {
        let cell = json!({"id": "rec_1", "title": "old"});
        let rewritten = rewrite_link_cell(&cell, "rec_1", Some("new")).unwrap();
        assert_eq!(rewritten, json!({"id": "rec_1", "title": "new"}));
    }

    #[test]
    fn leaves_cell_referencing_other_record_untouched() {
        let cell = json!({"id": "rec_2", "title": "old"});
        assert!(rewrite_link_cell(&cell, "rec_1", Some("new")).is_none());
    }

    #[test]
    fn rewrites_only_the_matching_entry_in_an_array_cell() {
        let cell = json!([{"id": "rec_1", "title": "old"}, {"id": "rec_2", "title": "keep"}]);
        let rewritten = rewrite_link_cell(&cell, "rec_1", Some("new")).unwrap();
        assert_eq!(rewritten, json!([{"id": "rec_1", "title": "new"}, {"id": "rec_2", "title": "keep"}]));
    }
}
