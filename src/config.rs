//! Engine configuration
//!
//! Constructed explicitly by the embedder and threaded through every service
//! constructor — no global or thread-local state (spec §9).

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the Table Engine. All fields have sane defaults via
/// [`EngineConfig::default`]; embedders override only what they need.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the backing libsql database file, or `:memory:`.
    pub db_path: PathBuf,

    /// Batch size used when the caller doesn't hint a size and the batch is
    /// between `min_batch_threshold` and 1000 rows (spec §4.5).
    pub default_batch_size: usize,

    /// Ceiling applied when a batch exceeds 1000 rows.
    pub max_batch_size: usize,

    /// Below this row count, the whole batch runs as a single chunk.
    pub min_batch_threshold: usize,

    /// How long a built dependency graph is cached before a rebuild is
    /// triggered on next read (spec §4.4).
    pub dependency_cache_ttl: Duration,

    /// SQLite busy timeout applied to every connection.
    pub busy_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            default_batch_size: 100,
            max_batch_size: 500,
            min_batch_threshold: 50,
            dependency_cache_ttl: Duration::from_secs(60),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Implements the batch-size formula from spec §4.5:
    /// `<50 ⇒ n`, `>1000 ⇒ 500`, else `baseSize (default 100)`. `n == 0` is
    /// clamped to 1: an empty batch is handled by callers short-circuiting
    /// before this ever runs, but the formula itself must never hand back a
    /// chunk size of 0 (`slice::chunks(0)` panics).
    pub fn batch_size_for(&self, n: usize) -> usize {
        if n < self.min_batch_threshold {
            n.max(1)
        } else if n > 1000 {
            self.max_batch_size
        } else {
            self.default_batch_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_formula_matches_spec_boundaries() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.batch_size_for(10), 10);
        assert_eq!(cfg.batch_size_for(49), 49);
        assert_eq!(cfg.batch_size_for(500), 100);
        assert_eq!(cfg.batch_size_for(1001), 500);
    }
}
