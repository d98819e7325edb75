//! Space — the top-level tenant container (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub deleted_time: Option<DateTime<Utc>>,
}

impl Space {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::ids::space_id(),
            owner_id: owner_id.into(),
            name: name.into(),
            created_time: now,
            updated_time: now,
            deleted_time: None,
        }
    }
}
