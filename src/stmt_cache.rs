//! Shared prepared-statement cache.
//!
//! Statements are cached per `(connection, SQL text)` so that each distinct
//! statement shape is prepared once per connection of the target pool and
//! never re-prepared for the rest of the run. Preparation for a given text is
//! serialised behind the write lock; cache hits only take the read lock.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Statement};
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct StmtCache {
    inner: Arc<RwLock<HashMap<(u32, String), Statement>>>,
}

impl StmtCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the prepared statement for `query` on this connection,
    /// preparing it on a miss. The cache never evicts during a run.
    pub async fn stmt_for(&self, conn: &mut Conn, query: &str) -> Result<Statement> {
        let key = (conn.id(), query.to_string());
        if let Some(stmt) = self.inner.read().await.get(&key) {
            return Ok(stmt.clone());
        }

        let mut cache = self.inner.write().await;
        if let Some(stmt) = cache.get(&key) {
            return Ok(stmt.clone());
        }
        let stmt = conn
            .prep(query)
            .await
            .with_context(|| format!("preparing statement ({query})"))?;
        cache.insert(key, stmt.clone());
        Ok(stmt)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_cache_is_empty() {
        assert_eq!(StmtCache::new().len().await, 0);
    }

    #[tokio::test]
    async fn test_clones_share_one_map() {
        let cache = StmtCache::new();
        let clone = cache.clone();
        assert!(Arc::ptr_eq(&cache.inner, &clone.inner));
    }
}
