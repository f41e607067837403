//! Service state management and component initialization

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

use crate::config::ServiceConfig;
use event_batcher::{BatchManagerCell, PgAggregationStore};

/// Service state shared by the HTTP handlers and the shutdown path
pub struct ServiceState {
    /// Service configuration
    pub config: ServiceConfig,

    /// Postgres-backed aggregation store
    pub store: Arc<PgAggregationStore>,

    /// The batch pipeline, started once per process
    pub batcher: Arc<BatchManagerCell<PgAggregationStore>>,
}

impl ServiceState {
    /// Connect to Postgres, apply migrations and start the batch pipeline
    pub async fn connect(config: ServiceConfig) -> Result<Self> {
        info!("Initializing service components...");

        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size())
            .min_connections(config.database.min_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&config.database.url)
            .await
            .context("Failed to connect to database")?;

        let store = Arc::new(PgAggregationStore::new(pool));

        if config.database.run_migrations {
            info!("Applying database migrations...");
            store.migrate().await.context("Failed to apply database migrations")?;
        }

        let batcher = Arc::new(BatchManagerCell::new(config.batcher.clone(), store.clone()));

        // Fail at startup rather than on the first request
        batcher.get_or_create().await.context("Failed to start batch pipeline")?;
        info!("Batch pipeline started");

        Ok(Self { config, store, batcher })
    }

    /// Drain the batch pipeline, then release database connections
    pub async fn shutdown(&self) {
        info!("Shutting down batch pipeline...");
        self.batcher.shutdown().await;

        info!("Closing database pool...");
        self.store.pool().close().await;
    }
}
