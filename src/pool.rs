use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use moka::future::Cache;

use crate::error::{ContentModelError, Result};

type PooledGrammar = Arc<dyn Any + Send + Sync>;

/// Reuse pool for compiled grammar objects owned by validation consumers.
///
/// Entries are opaque to this crate. Concurrent requests for the same key
/// wait for a single compilation.
#[derive(Clone)]
pub struct GrammarPool {
    cache: Cache<String, PooledGrammar>,
}

impl GrammarPool {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_capacity).build();

        Self { cache }
    }

    /// Get a compiled grammar from the pool, or compile it if missing.
    ///
    /// The `compile` future is only executed if the key is missing. A
    /// pooled entry of another type under the same key is dropped and the
    /// call fails; the next call compiles afresh.
    pub async fn get_or_compile<T, F, Fut>(&self, key: &str, compile: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let init = async { compile().await.map(|grammar| Arc::new(grammar) as PooledGrammar) };
        let pooled = self
            .cache
            .try_get_with(key.to_string(), init)
            .await
            .map_err(|e| ContentModelError::Cache(e.to_string()))?;

        match pooled.downcast::<T>() {
            Ok(grammar) => Ok(grammar),
            Err(_) => {
                self.cache.invalidate(key).await;
                Err(ContentModelError::Cache(format!(
                    "pooled grammar for {key} has another type"
                )))
            }
        }
    }

    pub async fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key).await?.downcast::<T>().ok()
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.cache.get(key).await.is_some()
    }
}

impl std::fmt::Debug for GrammarPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarPool")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}
