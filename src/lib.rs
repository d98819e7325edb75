//! Table Engine
//!
//! A multi-tenant, spreadsheet-style relational table engine: dynamic
//! physical-table schema management driven by logical Field definitions, a
//! computed-field dependency graph with recalculation, a Link-field
//! relational engine with symmetric reverse fields, and a ShareDB-style OT
//! channel that turns record mutations into ordered, published operations.
//!
//! [`services::TableEngine`] is the composition root; most embedders should
//! open one and use its component handles directly rather than constructing
//! [`schema`]/[`services`] types by hand.

pub mod cancel;
pub mod config;
pub mod db;
pub mod ids;
pub mod models;
pub mod schema;
pub mod services;

pub use config::EngineConfig;
pub use services::{EngineError, TableEngine};
