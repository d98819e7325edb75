//! Services
//!
//! The five higher-level components (C2-C6) plus the realtime channel (C7),
//! each grounded on a teacher service file and wired together by
//! [`TableEngine`]. [`crate::schema::SchemaProvider`] (C1) lives one layer
//! down since both `FieldRegistry` and `LinkSchemaManager` depend on it.

pub mod dependency_graph;
pub mod error;
pub mod field_registry;
pub mod link_schema_manager;
pub mod link_title_updater;
pub mod ot_channel;
pub mod record_store;
pub mod table_registry;

pub use dependency_graph::DependencyGraph;
pub use error::EngineError;
pub use field_registry::{FieldCreateRequest, FieldPatch, FieldRegistry};
pub use link_schema_manager::LinkSchemaManager;
pub use link_title_updater::LinkTitleUpdater;
pub use ot_channel::{OtChannel, OtOp};
pub use record_store::{BatchOutcome, BatchStrategy, RecordStore};
pub use table_registry::TableRegistry;

use crate::config::EngineConfig;
use crate::db::{Connection, SqliteDialect};
use crate::schema::SchemaProvider;
use std::sync::Arc;

/// Composition root: opens one [`Connection`] and wires every component
/// around it (spec §9 "no global state" — an embedder owns a `TableEngine`
/// and threads it explicitly).
pub struct TableEngine {
    pub schema: Arc<SchemaProvider>,
    pub tables: Arc<TableRegistry>,
    pub fields: Arc<FieldRegistry>,
    pub links: Arc<LinkSchemaManager>,
    pub dependencies: Arc<DependencyGraph>,
    pub records: Arc<RecordStore>,
    pub titles: Arc<LinkTitleUpdater>,
    pub ot: Arc<OtChannel>,
}

impl TableEngine {
    #[tracing::instrument(skip(config))]
    pub async fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let conn = Connection::open(config).await?;
        let ot = Arc::new(OtChannel::new());
        let schema = Arc::new(SchemaProvider::new(conn.clone(), Arc::new(SqliteDialect)));

        let tables = Arc::new(TableRegistry::new(conn.clone()));
        tables.ensure_meta_table().await?;

        let fields = Arc::new(FieldRegistry::new(conn.clone(), schema.clone(), ot.clone(), tables.clone()));
        fields.ensure_meta_table().await?;

        let dependencies = Arc::new(DependencyGraph::new(fields.clone(), config.dependency_cache_ttl));
        let records = Arc::new(RecordStore::new(
            conn,
            fields.clone(),
            tables.clone(),
            ot.clone(),
            Arc::new(config.clone()),
            dependencies.clone(),
        ));
        let links =
            Arc::new(LinkSchemaManager::new(fields.clone(), tables.clone(), schema.clone(), records.clone()));
        let titles = Arc::new(LinkTitleUpdater::new(fields.clone(), tables.clone(), records.clone(), links.clone()));
        records.bind_titles(&titles);

        Ok(Self { schema, tables, fields, links, dependencies, records, titles, ot })
    }
}
