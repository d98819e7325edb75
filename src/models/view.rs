//! View — out of core per spec §3, kept only so its persistence shape can be
//! referenced by the external interfaces of §6 (e.g. a View's `share_id`
//! surviving a Field rename).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewType {
    Grid,
    Kanban,
    Gallery,
    Calendar,
    Form,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    pub table_id: String,
    pub name: String,
    pub view_type: ViewType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    pub locked: bool,
}

impl View {
    pub fn new(table_id: impl Into<String>, name: impl Into<String>, view_type: ViewType) -> Self {
        Self {
            id: crate::ids::view_id(),
            table_id: table_id.into(),
            name: name.into(),
            view_type,
            filter: None,
            sort: None,
            column_meta: None,
            share_id: None,
            locked: false,
        }
    }
}
