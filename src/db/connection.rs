//! Connection management
//!
//! Thin wrapper around a libsql `Database`, following the same
//! `connect_with_timeout` pattern as the teacher's `DatabaseService`: every
//! async caller gets a fresh connection with a busy timeout set, which keeps
//! SQLite happy when Tokio moves futures between worker threads.

use crate::config::EngineConfig;
use crate::db::error::DbError;
use libsql::{Builder, Connection as LibsqlConnection, Database, OpenFlags};
use std::sync::Arc;

/// Raw `SQLITE_OPEN_URI`; not exposed as an `OpenFlags` constant by libsql,
/// so it has to be OR'd in via `from_bits_retain`.
const SQLITE_OPEN_URI: i32 = 0x0000_0040;

#[derive(Clone)]
pub struct Connection {
    db: Arc<Database>,
    busy_timeout_ms: u64,
    /// Keeps a shared-cache `:memory:` database alive for the lifetime of
    /// this handle: SQLite frees a shared-cache memory db as soon as its
    /// last connection closes, and every other caller here only ever
    /// borrows a connection for the span of one call.
    _memory_anchor: Option<Arc<LibsqlConnection>>,
}

impl Connection {
    pub async fn open(config: &EngineConfig) -> Result<Self, DbError> {
        let is_memory = config.db_path == std::path::Path::new(":memory:");

        if !is_memory {
            if let Some(parent) = config.db_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let (db, memory_anchor) = if is_memory {
            // Every connection re-opens the backing store from scratch
            // (see `connect_with_timeout`), so a plain ":memory:" path would
            // hand each caller an independent, empty database. A named
            // shared-cache URI keeps them all pointed at the same one.
            let uri = format!("file:mem_{}?mode=memory&cache=shared", uuid::Uuid::new_v4().simple());
            let flags = OpenFlags::from_bits_retain(
                OpenFlags::SQLITE_OPEN_READ_WRITE.bits() | OpenFlags::SQLITE_OPEN_CREATE.bits() | SQLITE_OPEN_URI,
            );
            let db = Builder::new_local(&uri)
                .flags(flags)
                .build()
                .await
                .map_err(|e| DbError::ConnectionFailed { path: config.db_path.clone(), source: e })?;
            let anchor = db.connect().map_err(DbError::from)?;
            (db, Some(Arc::new(anchor)))
        } else {
            let db = Builder::new_local(&config.db_path)
                .build()
                .await
                .map_err(|e| DbError::ConnectionFailed { path: config.db_path.clone(), source: e })?;
            (db, None)
        };

        let conn = Self {
            db: Arc::new(db),
            busy_timeout_ms: config.busy_timeout.as_millis() as u64,
            _memory_anchor: memory_anchor,
        };
        conn.init_pragmas().await?;
        Ok(conn)
    }

    async fn init_pragmas(&self) -> Result<(), DbError> {
        let conn = self.connect_with_timeout().await?;
        self.pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        self.pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms),
        )
        .await?;
        self.pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        Ok(())
    }

    async fn pragma(&self, conn: &LibsqlConnection, pragma: &str) -> Result<(), DbError> {
        let mut stmt = conn
            .prepare(pragma)
            .await
            .map_err(|e| DbError::sql_execution(format!("{pragma}: {e}")))?;
        stmt.query(())
            .await
            .map_err(|e| DbError::sql_execution(format!("{pragma}: {e}")))?;
        Ok(())
    }

    /// Recommended entry point for all async callers (see module docs).
    pub async fn connect_with_timeout(&self) -> Result<LibsqlConnection, DbError> {
        let conn = self.db.connect()?;
        self.pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout_ms),
        )
        .await?;
        Ok(conn)
    }

    /// Runs `body` inside a `BEGIN`/`COMMIT` block on a single connection,
    /// rolling back on any error. Generalizes the transaction pattern already
    /// present in `db_batch_create_nodes`/`db_batch_update_nodes`.
    pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T, DbError>
    where
        F: FnOnce(LibsqlConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, DbError>>,
    {
        let conn = self.connect_with_timeout().await?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| DbError::transaction(format!("BEGIN failed: {e}")))?;

        match body(conn.clone()).await {
            Ok(value) => {
                conn.execute("COMMIT", ())
                    .await
                    .map_err(|e| DbError::transaction(format!("COMMIT failed: {e}")))?;
                Ok(value)
            }
            Err(err) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                Err(err)
            }
        }
    }
}

/// Quotes a SQL identifier, doubling embedded quote characters, per spec
/// §4.1 ("identifiers never interpolated raw into SQL").
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("simple"), "\"simple\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[tokio::test]
    async fn open_in_memory_succeeds_and_enables_wal_pragmas() {
        let cfg = EngineConfig::in_memory();
        let conn = Connection::open(&cfg).await.unwrap();
        let c = conn.connect_with_timeout().await.unwrap();
        c.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
    }

    /// On-disk databases survive across independent `Connection::open` calls
    /// against the same path, unlike the shared-cache `:memory:` case above.
    #[tokio::test]
    async fn data_written_on_disk_is_visible_after_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        let cfg = EngineConfig::at_path(path);

        {
            let conn = Connection::open(&cfg).await.unwrap();
            let c = conn.connect_with_timeout().await.unwrap();
            c.execute("CREATE TABLE t (x INTEGER)", ()).await.unwrap();
            c.execute("INSERT INTO t (x) VALUES (7)", ()).await.unwrap();
        }

        let reopened = Connection::open(&cfg).await.unwrap();
        let c = reopened.connect_with_timeout().await.unwrap();
        let mut rows = c.query("SELECT x FROM t", ()).await.unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let x: i64 = row.get(0).unwrap();
        assert_eq!(x, 7);
    }
}
