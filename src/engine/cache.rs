//! Compiled statement cache
//!
//! Statements are compiled at most once per (namespace, name, role). The
//! first request for a key compiles while concurrent requests for the same
//! key wait on the entry's cell; every waiter then sees the same statement
//! or the same error. Failed compilations stay cached.

use dashmap::DashMap;
use soligraph_core::GqlResult;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::compile::Stmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: String,
    pub name: String,
    pub role: String,
}

impl CacheKey {
    pub fn new(namespace: &str, name: &str, role: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        }
    }
}

type Entry = Arc<OnceCell<GqlResult<Arc<Stmt>>>>;

pub struct StmtCache {
    entries: DashMap<CacheKey, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StmtCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached result for `key`, compiling it on first use.
    pub async fn get_or_compile<F>(&self, key: &CacheKey, compile: F) -> GqlResult<Arc<Stmt>>
    where
        F: FnOnce() -> GqlResult<Stmt>,
    {
        // Clone the cell out so no map shard lock is held while waiting.
        let cell = match self.entries.get(key) {
            Some(entry) => entry.value().clone(),
            None => self.entries.entry(key.clone()).or_default().value().clone(),
        };

        if let Some(result) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return result.clone();
        }

        let compiled = AtomicBool::new(false);
        let compiled_ref = &compiled;
        let result = cell
            .get_or_init(|| async move {
                compiled_ref.store(true, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                let result = compile().map(Arc::new);
                if let Err(e) = &result {
                    tracing::warn!(
                        namespace = %key.namespace,
                        name = %key.name,
                        role = %key.role,
                        "Compilation failed and is cached: {}",
                        e
                    );
                }
                result
            })
            .await;
        // Requests that waited on another request's compilation are hits.
        if !compiled.load(Ordering::Relaxed) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        result.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for StmtCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of keys seen
    pub entries: usize,
    /// Lookups answered without compiling, including waiters
    pub hits: u64,
    /// Compilations performed
    pub misses: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
