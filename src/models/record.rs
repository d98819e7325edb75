//! Record model
//!
//! A `Record` is one row of a Table's physical table (spec §3). Cell values
//! are untyped JSON at this layer — their shape is governed by the owning
//! Field's type (Link cells are `{id,title}` or an array thereof).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// `{id, title}` — the cached shape of a single Link cell reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCellValue {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub table_id: String,
    pub data: HashMap<String, Value>,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub created_by: String,
    pub last_modified_by: String,
}

impl Record {
    pub fn new(table_id: impl Into<String>, data: HashMap<String, Value>, user: impl Into<String>) -> Self {
        let now = Utc::now();
        let user = user.into();
        Self {
            id: crate::ids::record_id(),
            table_id: table_id.into(),
            data,
            version: 1,
            created_time: now,
            last_modified_time: now,
            created_by: user.clone(),
            last_modified_by: user,
        }
    }

    /// Extracts the `{id,title}`/[{id,title}] shape of a Link cell, if the
    /// field holds one.
    pub fn link_cell(&self, field_id: &str) -> Option<Vec<LinkCellValue>> {
        match self.data.get(field_id)? {
            Value::Object(obj) => single_link_value(obj).map(|v| vec![v]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_object())
                    .filter_map(single_link_value)
                    .collect(),
            ),
            _ => None,
        }
    }
}

fn single_link_value(obj: &Map<String, Value>) -> Option<LinkCellValue> {
    let id = obj.get("id")?.as_str()?.to_string();
    let title = obj.get("title").and_then(|v| v.as_str()).map(str::to_string);
    Some(LinkCellValue { id, title })
}
