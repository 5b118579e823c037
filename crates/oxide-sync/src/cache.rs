//! Downstream cache invalidation.
//!
//! Column metadata of synchronized tables may be cached by the application.
//! After a run the engine hands the keys of every touched table to a
//! [`CacheInvalidator`] in a single batch.

use std::future::Future;

use tracing::debug;

use crate::error::Result;

/// Prefix of the cache key holding a table's column metadata.
pub const TABLE_COLUMNS_PREFIX: &str = "table_columns:";

/// Returns the invalidation key for `table`.
#[must_use]
pub fn cache_key(table: &str) -> String {
    format!("{TABLE_COLUMNS_PREFIX}{table}")
}

/// Deletes cache entries in batches.
pub trait CacheInvalidator: Sync {
    /// Deletes every key in `keys` and returns how many entries were removed.
    fn delete_batch(&self, keys: &[String]) -> impl Future<Output = Result<usize>> + Send;
}

impl<C: CacheInvalidator> CacheInvalidator for &C {
    fn delete_batch(&self, keys: &[String]) -> impl Future<Output = Result<usize>> + Send {
        (**self).delete_batch(keys)
    }
}

/// Cache that holds nothing, for standalone runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl CacheInvalidator for NoopCache {
    fn delete_batch(&self, keys: &[String]) -> impl Future<Output = Result<usize>> + Send {
        let count = keys.len();
        async move {
            debug!(keys = count, "No cache configured, nothing to invalidate");
            Ok(0)
        }
    }
}

/// Invalidates the column cache of `tables` in one call. Makes no call at all
/// when `tables` is empty.
pub async fn invalidate_tables<C: CacheInvalidator>(cache: &C, tables: &[String]) -> Result<usize> {
    if tables.is_empty() {
        return Ok(0);
    }
    let keys: Vec<String> = tables.iter().map(|t| cache_key(t)).collect();
    let removed = cache.delete_batch(&keys).await?;
    debug!(keys = keys.len(), removed, "Invalidated table column cache");
    Ok(removed)
}
