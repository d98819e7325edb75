//! Data Model (spec §3)
//!
//! Entities and their ownership: a Base exclusively owns its Tables; a Table
//! exclusively owns its Fields, Views, and Records; a Field owns its
//! options; a Link field shares ownership with its symmetric counterpart
//! (weak back-reference — see [`crate::services::link_schema_manager`]).

pub mod base;
pub mod collaborator;
pub mod field;
pub mod record;
pub mod space;
pub mod table;
pub mod view;

pub use base::Base;
pub use collaborator::{Action, AllowAll, AttachmentRef, Collaborator, PermissionCollaborator, ResourceType};
pub use field::{
    AggregationFunction, AiTrigger, CommonOptions, Field, FieldOptions, FieldType, LinkOptions,
    Relationship, SelectChoice,
};
pub use record::{LinkCellValue, Record};
pub use space::Space;
pub use table::{Table, SYSTEM_COLUMNS};
pub use view::{View, ViewType};
