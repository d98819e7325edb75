//! Collaborator and the external permission/attachment collaborators
//!
//! The engine never infers permission from roles directly (spec §6); it
//! calls out to an injected [`PermissionCollaborator`]. HTTP/REST, auth, and
//! attachment byte storage are explicitly out of scope (spec §1) — only the
//! hook points are specified here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Space,
    Base,
    Table,
    Field,
    View,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Read,
    Update,
    Delete,
    Create,
    ManageCollaborator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: String,
    pub principal_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub role: String,
}

impl Collaborator {
    pub fn new(
        principal_id: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id: crate::ids::collaborator_id(),
            principal_id: principal_id.into(),
            resource_type,
            resource_id: resource_id.into(),
            role: role.into(),
        }
    }
}

/// External permission collaborator (spec §6). The engine calls `can` before
/// any mutating operation and surfaces `Forbidden` unchanged (spec §7).
#[async_trait]
pub trait PermissionCollaborator: Send + Sync {
    async fn can(&self, user: &str, resource_type: ResourceType, resource_id: &str, action: Action) -> bool;
}

/// Permits everything; useful for tests and for embedders that enforce
/// permissions upstream of the engine.
pub struct AllowAll;

#[async_trait]
impl PermissionCollaborator for AllowAll {
    async fn can(&self, _user: &str, _resource_type: ResourceType, _resource_id: &str, _action: Action) -> bool {
        true
    }
}

/// The shape an attachment cell value takes; bytes live in an external
/// object store addressed by `path` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    pub url: String,
    pub size: u64,
    pub mime_type: String,
    pub path: String,
}
