//! Field metadata
//!
//! A `Field` is a typed column of a `Table` (spec §3). Field options are
//! modeled as a tagged variant of strongly-typed records — one variant per
//! field type — rather than the free-form JSON map the original system uses
//! internally; a single JSON round-trip happens at the FieldRegistry
//! boundary (spec §9 "Re-architect as a tagged variant").

use serde::{Deserialize, Serialize};

/// The closed enum of field types (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    ShortText,
    LongText,
    Number,
    SingleSelect,
    MultiSelect,
    Date,
    DateTime,
    Checkbox,
    Link,
    Formula,
    Rollup,
    Lookup,
    Count,
    Attachment,
    Rating,
    User,
    Email,
    Phone,
    Url,
    Ai,
    Button,
    Duration,
}

impl FieldType {
    /// Computed fields are derived from other fields and are never directly
    /// written by clients (spec §3 invariant iv).
    pub fn is_computed(self) -> bool {
        matches!(
            self,
            FieldType::Formula | FieldType::Rollup | FieldType::Lookup | FieldType::Count
        )
    }

    /// "Virtual" fields per spec §4.3.1: skipped when auto-resolving a
    /// Link's `lookup_field_id`.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            FieldType::Formula | FieldType::Rollup | FieldType::Lookup | FieldType::Ai
        )
    }
}

/// Common configuration keys recognized across every field type (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatting: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectChoice {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    OneOne,
    OneMany,
    ManyOne,
    ManyMany,
}

impl Relationship {
    /// Inverts a relationship for symmetric-field wiring (spec §4.3.2):
    /// oneOne↔oneOne, oneMany↔manyOne, manyMany↔manyMany.
    pub fn reverse(self) -> Relationship {
        match self {
            Relationship::OneOne => Relationship::OneOne,
            Relationship::OneMany => Relationship::ManyOne,
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::ManyMany => Relationship::ManyMany,
        }
    }
}

/// Sub-record of a Link field (spec §3 "LinkOptions").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    pub foreign_table_id: String,
    pub relationship: Relationship,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_field_id: Option<String>,
    pub fk_host_table_name: String,
    pub self_key_name: String,
    pub foreign_key_name: String,
    pub is_symmetric: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symmetric_field_id: Option<String>,
    pub allow_multiple: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregationFunction {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountAll,
    Concat,
}

/// Tagged-variant field options, one arm per [`FieldType`] family, with the
/// recognized keys of spec §6 ("Field option schema").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldOptions {
    Number {
        precision: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        min_value: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_value: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default)]
        show_commas: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        currency: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default_value: Option<f64>,
    },
    Select {
        choices: Vec<SelectChoice>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default_value: Option<serde_json::Value>,
        #[serde(default)]
        prevent_auto_new_options: bool,
        /// Distinguishes singleSelect from multiSelect without a second variant.
        multiple: bool,
    },
    DateTime {
        format: String,
        include_time: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default_value: Option<String>,
    },
    Formula {
        expression: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        time_zone: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        formatting: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        show_as: Option<String>,
    },
    Rollup {
        link_field_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rollup_field_id: Option<String>,
        aggregation_function: AggregationFunction,
        #[serde(skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    Lookup {
        link_field_id: String,
        lookup_field_id: String,
    },
    Count {
        link_field_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<serde_json::Value>,
    },
    Link(LinkOptions),
    Rating {
        max: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        icon: Option<String>,
    },
    User {
        is_multiple: bool,
        #[serde(default)]
        options: Vec<serde_json::Value>,
    },
    Ai {
        provider: String,
        model: String,
        prompt: String,
        trigger: AiTrigger,
    },
    /// shortText/longText/checkbox/attachment/email/phone/url/button/duration
    /// share only the common option keys.
    Plain(CommonOptions),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AiTrigger {
    Manual,
    Auto,
}

impl FieldOptions {
    pub fn as_link(&self) -> Option<&LinkOptions> {
        match self {
            FieldOptions::Link(opts) => Some(opts),
            _ => None,
        }
    }

    pub fn as_link_mut(&mut self) -> Option<&mut LinkOptions> {
        match self {
            FieldOptions::Link(opts) => Some(opts),
            _ => None,
        }
    }

    /// The `link_field_id` a rollup/lookup/count field depends on (spec §4.4).
    pub fn dependent_link_field_id(&self) -> Option<&str> {
        match self {
            FieldOptions::Rollup { link_field_id, .. }
            | FieldOptions::Lookup { link_field_id, .. }
            | FieldOptions::Count { link_field_id, .. } => Some(link_field_id),
            _ => None,
        }
    }
}

/// A logical column of a Table (spec §3 "Field").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: String,
    pub table_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub field_type: FieldType,
    pub options: FieldOptions,
    pub db_field_name: String,
    pub db_field_type: String,
    pub order: i64,
    pub required: bool,
    pub unique: bool,
    pub is_primary: bool,
}

impl Field {
    pub fn is_computed(&self) -> bool {
        self.field_type.is_computed()
    }
}
