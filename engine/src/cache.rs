//! Time-bounded single-value cache with lazy refresh

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use netfence_common::Result;

/// Holds one value for `ttl`. Concurrent misses may each run the populate
/// closure; the last writer wins and every caller gets a valid value.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: RwLock<Option<(Instant, Arc<T>)>>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    async fn fresh(&self) -> Option<Arc<T>> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|(loaded_at, _)| loaded_at.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    pub async fn get_or_populate<F, Fut>(&self, populate: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.fresh().await {
            return Ok(value);
        }

        let value = Arc::new(populate().await?);
        *self.slot.write().await = Some((Instant::now(), value.clone()));
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}
