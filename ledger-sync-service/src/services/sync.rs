//! Sync orchestration: job queue, worker pool, and the per-connection sync
//! pipeline.
//!
//! Scheduled ticks, webhook pushes, and manual triggers all enqueue the same
//! `SyncRequest`; the job logic is trigger-agnostic. Within one job the
//! steps run sequentially (ingest -> match -> check -> enrich) because each
//! step depends on the previous one completing for the batch. Jobs for
//! different connections run in parallel under a semaphore; one connection
//! never runs twice concurrently.

use crate::models::{ConnectionStatus, SourceRecord};
use crate::services::consistency::ConsistencyChecker;
use crate::services::database::Database;
use crate::services::enrichment::EnrichmentEngine;
use crate::services::ingest::bank_feed::{normalize_transaction, BankFeedClient};
use crate::services::ingest::{card_export, order, receipt};
use crate::services::matching::MatchingEngine;
use crate::services::metrics::{RECORDS_INGESTED, SYNC_JOBS};
use crate::services::token_vault::TokenVault;
use dashmap::DashMap;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::retry::{retry_with_backoff, RetryConfig};
use service_core::utils::signature::verify_body_signature;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

// ============================================================================
// Job Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Scheduled,
    Webhook,
    Manual,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncRequest {
    pub connection_id: Uuid,
    pub reason: SyncReason,
}

/// Single job queue consumed by the worker pool. A connection already queued
/// or running is not enqueued twice; the webhook burst for a busy connection
/// collapses into the run already underway plus at most one queued follow-up.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<SyncRequest>,
    in_flight: Arc<DashMap<Uuid, ()>>,
}

impl SyncQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                in_flight: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    /// Enqueue a sync for a connection. Returns false when the connection is
    /// already queued or running.
    pub fn enqueue(&self, connection_id: Uuid, reason: SyncReason) -> bool {
        if self.in_flight.insert(connection_id, ()).is_some() {
            return false;
        }
        if self
            .tx
            .send(SyncRequest {
                connection_id,
                reason,
            })
            .is_err()
        {
            self.in_flight.remove(&connection_id);
            return false;
        }
        true
    }

    fn release(&self, connection_id: Uuid) {
        self.in_flight.remove(&connection_id);
    }
}

// ============================================================================
// Webhook / OAuth entry points
// ============================================================================

/// Inbound webhook event types pushed by the bank-feed provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    NewTransactions,
    AccountUpdated,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub connection_id: Uuid,
    pub event: WebhookEventType,
}

/// Authenticate and act on a provider webhook: verify the HMAC body
/// signature against the connection's secret, then enqueue an immediate
/// sync, distinct from the scheduled poll.
#[instrument(skip(db, queue, body, signature))]
pub async fn handle_webhook(
    db: &Database,
    queue: &SyncQueue,
    body: &str,
    signature: &str,
) -> Result<WebhookEvent, AppError> {
    let event: WebhookEvent = serde_json::from_str(body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!("bad webhook body: {}", e)))?;

    let connection = db
        .get_connection(event.connection_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown connection")))?;

    let valid = verify_body_signature(&connection.webhook_secret, body, signature)
        .map_err(AppError::InternalError)?;
    if !valid {
        warn!(connection_id = %event.connection_id, "Webhook signature rejected");
        return Err(AppError::SignatureInvalid);
    }

    info!(
        connection_id = %event.connection_id,
        event = ?event.event,
        "Webhook accepted"
    );
    queue.enqueue(event.connection_id, SyncReason::Webhook);

    Ok(event)
}

/// OAuth callback: exchange the authorization code for the initial token
/// pair, create the connection, and enqueue the first sync.
#[instrument(skip(db, client, queue, code), fields(user_id = %user_id))]
pub async fn complete_oauth_callback(
    db: &Database,
    client: &BankFeedClient,
    queue: &SyncQueue,
    user_id: Uuid,
    institution_id: &str,
    code: &str,
) -> Result<Uuid, AppError> {
    let pair = client.exchange_code(code).await?;
    let refresh_token = pair.refresh_token.ok_or_else(|| {
        AppError::InternalError(anyhow::anyhow!("provider returned no refresh token"))
    })?;
    let expires_utc = chrono::Utc::now() + chrono::Duration::seconds(pair.expires_in_secs);

    let webhook_secret = Uuid::new_v4().simple().to_string();

    let connection = db
        .create_connection(
            user_id,
            institution_id,
            &pair.access_token,
            &refresh_token,
            expires_utc,
            &webhook_secret,
        )
        .await?;

    queue.enqueue(connection.connection_id, SyncReason::Manual);

    Ok(connection.connection_id)
}

// ============================================================================
// Worker
// ============================================================================

/// Shared dependencies for sync jobs.
pub struct SyncContext {
    pub db: Arc<Database>,
    pub vault: Arc<TokenVault>,
    pub bank_client: Arc<BankFeedClient>,
    pub matcher: Arc<MatchingEngine>,
    pub checker: Arc<ConsistencyChecker>,
    pub enricher: Arc<EnrichmentEngine>,
    pub retry: RetryConfig,
    /// Serializes jobs per connection against triggers that bypass the
    /// queue's in-flight dedup.
    connection_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl SyncContext {
    pub fn new(
        db: Arc<Database>,
        vault: Arc<TokenVault>,
        bank_client: Arc<BankFeedClient>,
        matcher: Arc<MatchingEngine>,
        checker: Arc<ConsistencyChecker>,
        enricher: Arc<EnrichmentEngine>,
    ) -> Self {
        Self {
            db,
            vault,
            bank_client,
            matcher,
            checker,
            enricher,
            retry: RetryConfig::default(),
            connection_locks: DashMap::new(),
        }
    }

    fn connection_lock(&self, connection_id: Uuid) -> Arc<Mutex<()>> {
        self.connection_locks
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Worker pool draining the sync queue.
pub struct SyncWorker {
    ctx: Arc<SyncContext>,
    queue: SyncQueue,
    rx: Mutex<mpsc::UnboundedReceiver<SyncRequest>>,
    concurrency: usize,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl SyncWorker {
    pub fn new(
        ctx: Arc<SyncContext>,
        queue: SyncQueue,
        rx: mpsc::UnboundedReceiver<SyncRequest>,
        concurrency: usize,
    ) -> Self {
        Self {
            ctx,
            queue,
            rx: Mutex::new(rx),
            concurrency,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Request graceful shutdown. In-flight jobs drain before `run` returns.
    pub fn shutdown(&self) {
        info!("Sync worker shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }

    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!(concurrency = self.concurrency, "Starting sync worker");

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut rx = self.rx.lock().await;

        loop {
            let request = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = self.shutdown_notify.notified() => break,
            };

            if self.shutdown.load(Ordering::Relaxed) {
                self.queue.release(request.connection_id);
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let ctx = self.ctx.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let outcome = run_connection_sync(&ctx, request.connection_id, request.reason)
                    .await;
                if let Err(e) = outcome {
                    error!(
                        connection_id = %request.connection_id,
                        error = %e,
                        "Sync job failed"
                    );
                }
                queue.release(request.connection_id);
                drop(permit);
            });
        }

        info!("Waiting for in-flight sync jobs to complete...");
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("Sync worker stopped");
    }
}

// ============================================================================
// The sync pipeline
// ============================================================================

/// Run one connection sync: ingest -> match -> check -> enrich.
///
/// `AuthExpired` marks the connection and stops without error (nothing to
/// retry); `UpstreamUnavailable` records the error and leaves the cursor
/// where the last stored page put it, so the next tick resumes cleanly.
#[instrument(skip(ctx), fields(connection_id = %connection_id, reason = %reason.as_str()))]
pub async fn run_connection_sync(
    ctx: &SyncContext,
    connection_id: Uuid,
    reason: SyncReason,
) -> Result<(), AppError> {
    let lock = ctx.connection_lock(connection_id);
    let _guard = lock.lock().await;

    let Some(connection) = ctx.db.get_connection(connection_id).await? else {
        warn!(connection_id = %connection_id, "Sync requested for unknown connection");
        return Ok(());
    };

    if connection.status() == ConnectionStatus::Revoked {
        info!(connection_id = %connection_id, "Connection revoked; skipping sync");
        return Ok(());
    }

    let result = sync_steps(ctx, connection_id, connection.user_id, connection.sync_cursor).await;

    match &result {
        Ok(stored) => {
            SYNC_JOBS
                .with_label_values(&[reason.as_str(), "success"])
                .inc();
            ctx.db
                .set_connection_status(connection_id, ConnectionStatus::Active, None)
                .await?;
            info!(
                connection_id = %connection_id,
                records_stored = *stored,
                "Sync completed"
            );
            Ok(())
        }
        Err(e) if e.is_auth_failure() => {
            // The vault already marked the connection; surfaced, not retried.
            SYNC_JOBS
                .with_label_values(&[reason.as_str(), "auth_expired"])
                .inc();
            Ok(())
        }
        Err(e) if e.is_transient() => {
            SYNC_JOBS
                .with_label_values(&[reason.as_str(), "upstream_unavailable"])
                .inc();
            ctx.db
                .set_connection_status(
                    connection_id,
                    ConnectionStatus::Error,
                    Some(&e.to_string()),
                )
                .await?;
            warn!(connection_id = %connection_id, error = %e, "Sync deferred to next tick");
            Ok(())
        }
        Err(e) => {
            SYNC_JOBS
                .with_label_values(&[reason.as_str(), "failed"])
                .inc();
            Err(AppError::InternalError(anyhow::anyhow!(
                "sync failed: {}",
                e
            )))
        }
    }
}

async fn sync_steps(
    ctx: &SyncContext,
    connection_id: Uuid,
    user_id: Uuid,
    mut cursor: Option<String>,
) -> Result<u32, AppError> {
    let token = ctx.vault.get_valid_token(connection_id).await?;

    // Accounts first: transactions reference them, and balances feed the
    // consistency check.
    let provider_accounts = retry_with_backoff(&ctx.retry, "fetch_accounts", || {
        let client = ctx.bank_client.clone();
        let token = token.expose_secret().clone();
        async move { client.fetch_accounts(&token).await }
    })
    .await?;

    let mut account_ids = HashMap::new();
    for provider_account in &provider_accounts {
        let balance = crate::services::ingest::minor_units_to_decimal(
            provider_account.balance_minor,
            &provider_account.currency,
        );
        let account = ctx
            .db
            .upsert_account(
                connection_id,
                user_id,
                &provider_account.account_id,
                &provider_account.currency,
                balance,
                provider_account.balance_as_of,
            )
            .await?;
        account_ids.insert(provider_account.account_id.clone(), account.account_id);
    }

    // Paginated ingestion. Each page is stored before its cursor is
    // persisted; an interruption between pages resumes from the last stored
    // one, and upsert-by-external-id absorbs the resulting redelivery.
    let mut batch: Vec<SourceRecord> = Vec::new();
    loop {
        let page = retry_with_backoff(&ctx.retry, "fetch_transactions_page", || {
            let client = ctx.bank_client.clone();
            let token = token.expose_secret().clone();
            let cursor = cursor.clone();
            async move {
                client
                    .fetch_transactions_page(&token, cursor.as_deref())
                    .await
            }
        })
        .await?;

        for provider_txn in &page.transactions {
            match normalize_transaction(provider_txn, &account_ids) {
                Ok(record) => {
                    let (stored, _inserted) =
                        ctx.db.upsert_source_record(user_id, &record).await?;
                    RECORDS_INGESTED
                        .with_label_values(&["bank_feed", "ok"])
                        .inc();
                    batch.push(stored);
                }
                Err(e) => {
                    RECORDS_INGESTED
                        .with_label_values(&["bank_feed", "malformed"])
                        .inc();
                    warn!(error = %e, "Skipping malformed bank record");
                }
            }
        }

        ctx.db
            .advance_sync_cursor(connection_id, &page.next_cursor)
            .await?;
        cursor = Some(page.next_cursor);

        if !page.has_more {
            break;
        }
    }

    // Match the fresh bank batch, then retry pending receipts/orders that
    // arrived before their bank evidence.
    for record in &batch {
        ctx.matcher.match_record(record).await?;
    }
    ctx.matcher.match_pending_records(user_id).await?;

    // Consistency over every account this connection owns.
    for account in ctx.db.list_accounts_for_connection(connection_id).await? {
        ctx.checker.check_account(&account).await?;
    }

    ctx.enricher.enrich_user(user_id).await?;

    Ok(batch.len() as u32)
}

// ============================================================================
// Document submission (non-bank sources)
// ============================================================================

/// Store and match a batch of receipt payloads for a user.
pub async fn submit_receipts(
    ctx: &SyncContext,
    user_id: Uuid,
    payloads: &[String],
) -> Result<u32, AppError> {
    let batch = receipt::ingest_receipts(payloads);
    store_and_match(ctx, user_id, batch).await
}

/// Store and match a batch of marketplace order payloads for a user.
pub async fn submit_orders(
    ctx: &SyncContext,
    user_id: Uuid,
    payloads: &[String],
) -> Result<u32, AppError> {
    let batch = order::ingest_orders(payloads);
    store_and_match(ctx, user_id, batch).await
}

/// Store and match a card-network CSV export for a user.
pub async fn submit_card_export(
    ctx: &SyncContext,
    user_id: Uuid,
    csv_data: &str,
    account_id: Option<Uuid>,
) -> Result<u32, AppError> {
    let batch = card_export::ingest_card_export(csv_data, account_id);
    store_and_match(ctx, user_id, batch).await
}

async fn store_and_match(
    ctx: &SyncContext,
    user_id: Uuid,
    batch: crate::services::ingest::IngestBatch,
) -> Result<u32, AppError> {
    let mut stored_count = 0;
    for record in &batch.records {
        let (stored, _inserted) = ctx.db.upsert_source_record(user_id, record).await?;
        ctx.matcher.match_record(&stored).await?;
        stored_count += 1;
    }
    ctx.enricher.enrich_user(user_id).await?;
    Ok(stored_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_dedups_connections_in_flight() {
        let (queue, mut rx) = SyncQueue::new();
        let connection = Uuid::new_v4();

        assert!(queue.enqueue(connection, SyncReason::Scheduled));
        // A webhook for the same connection collapses into the queued job.
        assert!(!queue.enqueue(connection, SyncReason::Webhook));

        // A different connection is unaffected.
        assert!(queue.enqueue(Uuid::new_v4(), SyncReason::Webhook));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.connection_id, connection);
        assert_eq!(first.reason, SyncReason::Scheduled);

        // Once released, the connection can be enqueued again.
        queue.release(connection);
        assert!(queue.enqueue(connection, SyncReason::Manual));
    }

    #[test]
    fn webhook_event_parses_snake_case() {
        let body = format!(
            r#"{{"connection_id":"{}","event":"new_transactions"}}"#,
            Uuid::new_v4()
        );
        let event: WebhookEvent = serde_json::from_str(&body).unwrap();
        assert_eq!(event.event, WebhookEventType::NewTransactions);
    }
}
