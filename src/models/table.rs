//! Table — a logical table backed by a physical table (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System columns present on every physical table (spec §3, §6).
pub const SYSTEM_COLUMNS: &[(&str, &str)] = &[
    ("__id", "TEXT PRIMARY KEY"),
    ("__version", "BIGINT NOT NULL"),
    ("__created_time", "TIMESTAMP"),
    ("__last_modified_time", "TIMESTAMP"),
    ("__created_by", "TEXT"),
    ("__last_modified_by", "TEXT"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub id: String,
    pub base_id: String,
    pub name: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl Table {
    pub fn new(base_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::table_id(),
            base_id: base_id.into(),
            name: name.into(),
            version: 1,
            created_time: now,
            updated_time: now,
        }
    }

    /// Deterministic physical table name, `<baseId>_<tableId>` (spec §3/§6
    /// names this `<baseId>.<tableId>` "or a provider-equivalent" — SQLite
    /// has no schema-namespacing, so the dot becomes an underscore).
    pub fn physical_table_name(&self) -> String {
        format!("{}_{}", self.base_id, self.id)
    }
}
