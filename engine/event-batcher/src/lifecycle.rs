//! Lazily started, shared BatchManager instance

use crate::config::BatcherConfig;
use crate::error::Result;
use crate::manager::BatchManager;
use crate::store::AggregationStore;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Holds at most one BatchManager, started on first use.
///
/// Owned by whoever owns the store (the service state) and handed to request
/// handlers by reference.
pub struct BatchManagerCell<S: AggregationStore> {
    config: BatcherConfig,
    store: Arc<S>,
    manager: OnceCell<Arc<BatchManager<S>>>,
}

impl<S: AggregationStore> BatchManagerCell<S> {
    pub fn new(config: BatcherConfig, store: Arc<S>) -> Self {
        Self { config, store, manager: OnceCell::new() }
    }

    /// The one manager, started by whichever caller gets here first
    pub async fn get_or_create(&self) -> Result<Arc<BatchManager<S>>> {
        let start = || async { BatchManager::start(self.config.clone(), self.store.clone()) };
        let manager = self.manager.get_or_try_init(start).await?;
        Ok(manager.clone())
    }

    /// The manager if it has been started
    pub fn get(&self) -> Option<Arc<BatchManager<S>>> {
        self.manager.get().cloned()
    }

    /// Shut the manager down if one was ever started
    pub async fn shutdown(&self) {
        if let Some(manager) = self.manager.get() {
            manager.shutdown().await;
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAggregationStore;

    #[tokio::test]
    async fn test_lazy_start() {
        let cell = BatchManagerCell::new(
            BatcherConfig { worker_count: 1, ..Default::default() },
            Arc::new(MemoryAggregationStore::new()),
        );
        assert!(cell.get().is_none());

        // Nothing started, nothing to stop
        cell.shutdown().await;

        let first = cell.get_or_create().await.unwrap();
        let second = cell.get_or_create().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cell.shutdown().await;
        assert!(first.is_shutdown_complete());
    }
}
