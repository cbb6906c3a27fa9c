//! Application startup and lifecycle management.

use crate::config::LedgerSyncConfig;
use crate::services::consistency::ConsistencyChecker;
use crate::services::enrichment::{Classifier, EnrichmentEngine};
use crate::services::ingest::bank_feed::BankFeedClient;
use crate::services::matching::MatchingEngine;
use crate::services::sync::{SyncContext, SyncQueue, SyncWorker};
use crate::services::token_vault::TokenVault;
use crate::services::{init_metrics, Database};
use service_core::error::AppError;
use std::sync::Arc;

/// Shared application state handed to library consumers (webhook/OAuth
/// entry points, the read API caller).
#[derive(Clone)]
pub struct AppState {
    pub config: LedgerSyncConfig,
    pub db: Arc<Database>,
    pub queue: SyncQueue,
    pub ctx: Arc<SyncContext>,
}

/// Application container for managing the sync daemon lifecycle.
pub struct Application {
    state: AppState,
    worker: Arc<SyncWorker>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: LedgerSyncConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, true).await
    }

    /// Build without running migrations (tests apply them separately).
    pub async fn build_without_migrations(config: LedgerSyncConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, false).await
    }

    /// Build with an external classification collaborator plugged in.
    pub async fn build_with_classifier(
        config: LedgerSyncConfig,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, Some(classifier), true).await
    }

    async fn build_internal(
        config: LedgerSyncConfig,
        classifier: Option<Arc<dyn Classifier>>,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Arc::new(
            Database::new(
                &config.database.url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await?,
        );

        if run_migrations {
            db.run_migrations().await?;
        }

        let bank_client = Arc::new(BankFeedClient::new(config.bank_feed.clone()));
        let vault = Arc::new(TokenVault::new(
            db.clone(),
            bank_client.clone(),
            config.sync.token_min_validity_secs,
        ));
        let matcher = Arc::new(MatchingEngine::new(db.clone(), config.matching.clone()));
        let checker = Arc::new(ConsistencyChecker::new(
            db.clone(),
            config.matching.balance_tolerance,
        ));
        let enricher = Arc::new(EnrichmentEngine::new(db.clone(), classifier));

        let ctx = Arc::new(SyncContext::new(
            db.clone(),
            vault,
            bank_client,
            matcher,
            checker,
            enricher,
        ));

        let (queue, rx) = SyncQueue::new();
        let worker = Arc::new(SyncWorker::new(
            ctx.clone(),
            queue.clone(),
            rx,
            config.sync.concurrency,
        ));

        let state = AppState {
            config,
            db,
            queue,
            ctx,
        };

        Ok(Self { state, worker })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Enqueue a sync for every active connection. The cadence scheduler
    /// collaborator calls this on its tick.
    pub async fn enqueue_scheduled_syncs(&self) -> Result<u32, AppError> {
        let connections = self.state.db.list_active_connections().await?;
        let mut enqueued = 0;
        for connection in connections {
            if self.state.queue.enqueue(
                connection.connection_id,
                crate::services::sync::SyncReason::Scheduled,
            ) {
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Request graceful shutdown: the worker drains in-flight jobs.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }

    /// Run the sync worker until shutdown is requested.
    pub async fn run_until_stopped(&self) -> std::io::Result<()> {
        self.state.db.health_check().await.map_err(|e| {
            std::io::Error::other(format!("Database unavailable at startup: {}", e))
        })?;

        self.worker.run().await;
        Ok(())
    }
}
