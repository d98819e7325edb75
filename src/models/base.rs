//! Base — a container of Tables owned by a Space (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Base {
    pub id: String,
    pub space_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl Base {
    pub fn new(space_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::base_id(),
            space_id: space_id.into(),
            name: name.into(),
            icon: None,
            created_time: now,
            updated_time: now,
        }
    }

    /// The physical schema namespace dropped when a Base is deleted (spec §3).
    pub fn schema_namespace(&self) -> String {
        self.id.clone()
    }
}
