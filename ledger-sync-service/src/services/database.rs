//! Database service for ledger-sync-service.

#![allow(clippy::too_many_arguments)]

use crate::models::{
    Account, Anomaly, AnomalyDetail, BankConnection, CategoryRule, ConnectionStatus,
    DirectDebitMapping, Direction, MatchRecord, MatchRule, MatchState, NewSourceRecord,
    SourceRecord, Transaction, TransactionMetadata,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Filters for the read API. Every query is additionally scoped to the
/// requesting user's ownership chain.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub account_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub category: Option<String>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "ledger-sync-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // User Operations
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn create_user(&self, email: &str) -> Result<Uuid, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_user"])
            .start_timer();

        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (user_id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "email already registered"))?;

        timer.observe_duration();
        info!(user_id = %user_id, "User created");

        Ok(user_id)
    }

    // =========================================================================
    // Bank Connection Operations
    // =========================================================================

    #[instrument(skip(self, access_token, refresh_token, webhook_secret), fields(user_id = %user_id))]
    pub async fn create_connection(
        &self,
        user_id: Uuid,
        institution_id: &str,
        access_token: &str,
        refresh_token: &str,
        token_expires_utc: DateTime<Utc>,
        webhook_secret: &str,
    ) -> Result<BankConnection, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_connection"])
            .start_timer();

        let connection_id = Uuid::new_v4();
        let connection = sqlx::query_as::<_, BankConnection>(
            r#"
            INSERT INTO bank_connections (connection_id, user_id, institution_id, access_token, refresh_token, token_expires_utc, status, webhook_secret)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING connection_id, user_id, institution_id, access_token, refresh_token, token_expires_utc, sync_cursor, status, last_error, webhook_secret, created_utc, updated_utc
            "#,
        )
        .bind(connection_id)
        .bind(user_id)
        .bind(institution_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_utc)
        .bind(ConnectionStatus::Active.as_str())
        .bind(webhook_secret)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create connection: {}", e)))?;

        timer.observe_duration();
        info!(connection_id = %connection.connection_id, institution_id = %institution_id, "Bank connection created");

        Ok(connection)
    }

    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn get_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<BankConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_connection"])
            .start_timer();

        let connection = sqlx::query_as::<_, BankConnection>(
            r#"
            SELECT connection_id, user_id, institution_id, access_token, refresh_token, token_expires_utc, sync_cursor, status, last_error, webhook_secret, created_utc, updated_utc
            FROM bank_connections
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get connection: {}", e)))?;

        timer.observe_duration();

        Ok(connection)
    }

    #[instrument(skip(self))]
    pub async fn list_active_connections(&self) -> Result<Vec<BankConnection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_connections"])
            .start_timer();

        let connections = sqlx::query_as::<_, BankConnection>(
            r#"
            SELECT connection_id, user_id, institution_id, access_token, refresh_token, token_expires_utc, sync_cursor, status, last_error, webhook_secret, created_utc, updated_utc
            FROM bank_connections
            WHERE status = 'active'
            ORDER BY connection_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list connections: {}", e))
        })?;

        timer.observe_duration();

        Ok(connections)
    }

    /// Persist a rotated token pair after a refresh exchange.
    #[instrument(skip(self, access_token, refresh_token), fields(connection_id = %connection_id))]
    pub async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        token_expires_utc: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_connection_tokens"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_connections
            SET access_token = $2, refresh_token = $3, token_expires_utc = $4, updated_utc = NOW()
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(token_expires_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update tokens: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    /// Advance the sync cursor. Called only after the page it covers is stored.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn advance_sync_cursor(
        &self,
        connection_id: Uuid,
        cursor: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_sync_cursor"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_connections
            SET sync_cursor = $2, updated_utc = NOW()
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .bind(cursor)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to advance cursor: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(connection_id = %connection_id, status = %status.as_str()))]
    pub async fn set_connection_status(
        &self,
        connection_id: Uuid,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_connection_status"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE bank_connections
            SET status = $2, last_error = $3, updated_utc = NOW()
            WHERE connection_id = $1
            "#,
        )
        .bind(connection_id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set connection status: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Upsert an account by (connection, external id), refreshing the
    /// reported balance. Idempotent against upstream redelivery.
    #[instrument(skip(self), fields(connection_id = %connection_id, external_id = %external_id))]
    pub async fn upsert_account(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        external_id: &str,
        currency: &str,
        reported_balance: Decimal,
        balance_as_of_utc: Option<DateTime<Utc>>,
    ) -> Result<Account, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (account_id, connection_id, user_id, external_id, currency, reported_balance, balance_as_of_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (connection_id, external_id) DO UPDATE
            SET reported_balance = EXCLUDED.reported_balance,
                balance_as_of_utc = EXCLUDED.balance_as_of_utc,
                updated_utc = NOW()
            RETURNING account_id, connection_id, user_id, external_id, currency, reported_balance, balance_as_of_utc, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(connection_id)
        .bind(user_id)
        .bind(external_id)
        .bind(currency)
        .bind(reported_balance)
        .bind(balance_as_of_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert account: {}", e)))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_account"])
            .start_timer();

        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT account_id, connection_id, user_id, external_id, currency, reported_balance, balance_as_of_utc, created_utc, updated_utc
            FROM accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get account: {}", e)))?;

        timer.observe_duration();

        Ok(account)
    }

    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn list_accounts_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<Account>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_accounts_for_connection"])
            .start_timer();

        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT account_id, connection_id, user_id, external_id, currency, reported_balance, balance_as_of_utc, created_utc, updated_utc
            FROM accounts
            WHERE connection_id = $1
            ORDER BY account_id
            "#,
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list accounts: {}", e)))?;

        timer.observe_duration();

        Ok(accounts)
    }

    // =========================================================================
    // Source Record Operations
    // =========================================================================

    /// Upsert a source record by (user, source type, external id).
    ///
    /// Upstream APIs may redeliver pages; the unique key turns at-least-once
    /// delivery into exactly-once storage. Returns the stored row and whether
    /// it was newly inserted. A redelivered record never clobbers match
    /// state.
    #[instrument(skip(self, record), fields(user_id = %user_id, source_type = %record.source_type.as_str(), external_id = %record.external_id))]
    pub async fn upsert_source_record(
        &self,
        user_id: Uuid,
        record: &NewSourceRecord,
    ) -> Result<(SourceRecord, bool), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_source_record"])
            .start_timer();

        use sqlx::{FromRow, Row};

        let line_items = record.line_items.as_ref().map(|items| Json(items.clone()));

        // The no-op DO UPDATE makes RETURNING yield the existing row on
        // redelivery; xmax = 0 only on a fresh insert.
        let row = sqlx::query(
            r#"
            INSERT INTO source_records (record_id, user_id, account_id, source_type, external_id, amount, currency, occurred_utc, merchant_raw, line_items, match_state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'unmatched')
            ON CONFLICT (user_id, source_type, external_id) DO UPDATE
            SET merchant_raw = source_records.merchant_raw
            RETURNING record_id, user_id, account_id, source_type, external_id, amount, currency, occurred_utc, merchant_raw, line_items, match_state, transaction_id, ingested_utc,
                      (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(record.account_id)
        .bind(record.source_type.as_str())
        .bind(&record.external_id)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(record.occurred_utc)
        .bind(&record.merchant_raw)
        .bind(line_items)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to upsert source record: {}", e))
        })?;

        let inserted: bool = row.try_get("inserted").unwrap_or(true);
        let stored = SourceRecord::from_row(&row).map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to decode source record: {}", e))
        })?;

        timer.observe_duration();

        Ok((stored, inserted))
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn get_source_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<SourceRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_source_record"])
            .start_timer();

        let record = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT record_id, user_id, account_id, source_type, external_id, amount, currency, occurred_utc, merchant_raw, line_items, match_state, transaction_id, ingested_utc
            FROM source_records
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get source record: {}", e))
        })?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_unmatched_records(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SourceRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unmatched_records"])
            .start_timer();

        let records = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT record_id, user_id, account_id, source_type, external_id, amount, currency, occurred_utc, merchant_raw, line_items, match_state, transaction_id, ingested_utc
            FROM source_records
            WHERE user_id = $1 AND match_state = 'unmatched'
            ORDER BY occurred_utc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list unmatched records: {}", e))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    /// Source records contributing to any of the given transactions.
    #[instrument(skip(self, transaction_ids))]
    pub async fn list_source_records_for_transactions(
        &self,
        transaction_ids: &[Uuid],
    ) -> Result<Vec<SourceRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_source_records_for_transactions"])
            .start_timer();

        let records = sqlx::query_as::<_, SourceRecord>(
            r#"
            SELECT record_id, user_id, account_id, source_type, external_id, amount, currency, occurred_utc, merchant_raw, line_items, match_state, transaction_id, ingested_utc
            FROM source_records
            WHERE transaction_id = ANY($1)
            "#,
        )
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to list records for transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    #[instrument(skip(self), fields(record_id = %record_id, state = %state.as_str()))]
    pub async fn set_record_match_state(
        &self,
        record_id: Uuid,
        state: MatchState,
        transaction_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_record_match_state"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE source_records
            SET match_state = $2, transaction_id = $3
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .bind(state.as_str())
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set record match state: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    #[instrument(skip(self, metadata), fields(user_id = %user_id))]
    pub async fn create_transaction(
        &self,
        user_id: Uuid,
        account_id: Option<Uuid>,
        amount: Decimal,
        direction: Direction,
        occurred_on: NaiveDate,
        merchant_name: &str,
        metadata: &TransactionMetadata,
    ) -> Result<Transaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(account_id)
        .bind(amount)
        .bind(direction.as_str())
        .bind(occurred_on)
        .bind(merchant_name)
        .bind(Json(metadata.clone()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(transaction_id = %transaction.transaction_id, "Transaction created");

        Ok(transaction)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            FROM transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e)))?;

        timer.observe_duration();

        Ok(transaction)
    }

    /// Candidate transactions for fuzzy matching: same user and direction,
    /// date inside the window, amount inside the tolerance band.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn find_candidate_transactions(
        &self,
        user_id: Uuid,
        direction: Direction,
        date_from: NaiveDate,
        date_to: NaiveDate,
        amount_min: Decimal,
        amount_max: Decimal,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_candidate_transactions"])
            .start_timer();

        let candidates = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            FROM transactions
            WHERE user_id = $1
              AND direction = $2
              AND occurred_on BETWEEN $3 AND $4
              AND amount BETWEEN $5 AND $6
            ORDER BY occurred_on, transaction_id
            "#,
        )
        .bind(user_id)
        .bind(direction.as_str())
        .bind(date_from)
        .bind(date_to)
        .bind(amount_min)
        .bind(amount_max)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to find candidates: {}", e))
        })?;

        timer.observe_duration();

        Ok(candidates)
    }

    /// The read API. Always scoped by `user_id`: the caller's ownership chain
    /// is the confidentiality boundary.
    #[instrument(skip(self, filter), fields(user_id = %user_id))]
    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<(Vec<Transaction>, Option<Uuid>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            FROM transactions
            WHERE user_id = $1
              AND ($2::uuid IS NULL OR account_id = $2)
              AND ($3::date IS NULL OR occurred_on >= $3)
              AND ($4::date IS NULL OR occurred_on <= $4)
              AND ($5::text IS NULL OR category = $5)
              AND ($6::uuid IS NULL OR transaction_id > $6)
            ORDER BY transaction_id
            LIMIT $7
            "#,
        )
        .bind(user_id)
        .bind(filter.account_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.category.as_deref())
        .bind(page_token)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        timer.observe_duration();

        let has_more = transactions.len() > limit as usize;
        let mut transactions = transactions;
        if has_more {
            transactions.pop();
        }
        let next_token = if has_more {
            transactions.last().map(|t| t.transaction_id)
        } else {
            None
        };

        Ok((transactions, next_token))
    }

    /// Ordered transaction history for an account's balance recomputation.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn list_transactions_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions_for_account"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            FROM transactions
            WHERE account_id = $1
            ORDER BY occurred_on, created_utc, transaction_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to list account transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();

        Ok(transactions)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_unenriched_transactions(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unenriched_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT transaction_id, user_id, account_id, amount, direction, occurred_on, merchant_name, category, subcategory, provisional, metadata, created_utc, updated_utc
            FROM transactions
            WHERE user_id = $1 AND (category IS NULL OR provisional = TRUE)
            ORDER BY occurred_on, transaction_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to list unenriched transactions: {}",
                e
            ))
        })?;

        timer.observe_duration();

        Ok(transactions)
    }

    /// Reset the canonical amount when first bank-feed evidence arrives for
    /// a transaction seeded from another bank-sourced record.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn update_transaction_amount(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
        direction: Direction,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_amount"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE transactions
            SET amount = $2, direction = $3, updated_utc = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(amount)
        .bind(direction.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update amount: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, metadata), fields(transaction_id = %transaction_id))]
    pub async fn update_transaction_metadata(
        &self,
        transaction_id: Uuid,
        metadata: &TransactionMetadata,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_metadata"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE transactions
            SET metadata = $2, updated_utc = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(Json(metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update metadata: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self, metadata), fields(transaction_id = %transaction_id))]
    pub async fn update_transaction_enrichment(
        &self,
        transaction_id: Uuid,
        category: &str,
        subcategory: Option<&str>,
        provisional: bool,
        metadata: &TransactionMetadata,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_enrichment"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE transactions
            SET category = $2, subcategory = $3, provisional = $4, metadata = $5, updated_utc = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(category)
        .bind(subcategory)
        .bind(provisional)
        .bind(Json(metadata.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update enrichment: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    // =========================================================================
    // Match Operations
    // =========================================================================

    #[instrument(skip(self), fields(record_id = %record_id, transaction_id = %transaction_id))]
    pub async fn create_match(
        &self,
        record_id: Uuid,
        transaction_id: Uuid,
        rule: MatchRule,
        confidence: f64,
    ) -> Result<MatchRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_match"])
            .start_timer();

        let m = sqlx::query_as::<_, MatchRecord>(
            r#"
            INSERT INTO matches (match_id, record_id, transaction_id, rule, confidence)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING match_id, record_id, transaction_id, rule, confidence, matched_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record_id)
        .bind(transaction_id)
        .bind(rule.as_str())
        .bind(confidence)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, "source record already matched"))?;

        timer.observe_duration();
        info!(match_id = %m.match_id, rule = %m.rule, "Match created");

        Ok(m)
    }

    /// Existing match for a source record, if any. Step 1 of the cascade.
    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn get_match_for_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<MatchRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_match_for_record"])
            .start_timer();

        let m = sqlx::query_as::<_, MatchRecord>(
            r#"
            SELECT match_id, record_id, transaction_id, rule, confidence, matched_utc
            FROM matches
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get match: {}", e)))?;

        timer.observe_duration();

        Ok(m)
    }

    // =========================================================================
    // Category Rule Operations
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn create_category_rule(
        &self,
        user_id: Option<Uuid>,
        merchant_pattern: &str,
        match_type: &str,
        min_amount: Option<Decimal>,
        max_amount: Option<Decimal>,
        category: &str,
        subcategory: Option<&str>,
        priority: i32,
    ) -> Result<CategoryRule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_category_rule"])
            .start_timer();

        let rule = sqlx::query_as::<_, CategoryRule>(
            r#"
            INSERT INTO category_rules (rule_id, user_id, merchant_pattern, match_type, min_amount, max_amount, category, subcategory, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING rule_id, user_id, merchant_pattern, match_type, min_amount, max_amount, category, subcategory, priority, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(merchant_pattern)
        .bind(match_type)
        .bind(min_amount)
        .bind(max_amount)
        .bind(category)
        .bind(subcategory)
        .bind(priority)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create category rule: {}", e))
        })?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, "Category rule created");

        Ok(rule)
    }

    /// Active rules visible to a user: their own plus global rules, user
    /// rules first at equal priority.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_rules_for_user(&self, user_id: Uuid) -> Result<Vec<CategoryRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules_for_user"])
            .start_timer();

        let rules = sqlx::query_as::<_, CategoryRule>(
            r#"
            SELECT rule_id, user_id, merchant_pattern, match_type, min_amount, max_amount, category, subcategory, priority, is_active, created_utc
            FROM category_rules
            WHERE (user_id = $1 OR user_id IS NULL) AND is_active = TRUE
            ORDER BY priority, (user_id IS NULL), rule_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list rules: {}", e)))?;

        timer.observe_duration();

        Ok(rules)
    }

    // =========================================================================
    // Direct Debit Mapping Operations
    // =========================================================================

    #[instrument(skip(self), fields(user_id = %user_id, merchant_key = %merchant_key))]
    pub async fn create_direct_debit_mapping(
        &self,
        user_id: Uuid,
        merchant_key: &str,
        payee: &str,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<DirectDebitMapping, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_direct_debit_mapping"])
            .start_timer();

        let mapping = sqlx::query_as::<_, DirectDebitMapping>(
            r#"
            INSERT INTO direct_debit_mappings (mapping_id, user_id, merchant_key, payee, category, subcategory)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING mapping_id, user_id, merchant_key, payee, category, subcategory, is_active, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(merchant_key)
        .bind(payee)
        .bind(category)
        .bind(subcategory)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, "active mapping already exists for merchant"))?;

        timer.observe_duration();
        info!(mapping_id = %mapping.mapping_id, "Direct debit mapping created");

        Ok(mapping)
    }

    #[instrument(skip(self), fields(mapping_id = %mapping_id))]
    pub async fn deactivate_direct_debit_mapping(&self, mapping_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_direct_debit_mapping"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE direct_debit_mappings
            SET is_active = FALSE
            WHERE mapping_id = $1
            "#,
        )
        .bind(mapping_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to deactivate mapping: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_direct_debit_mappings(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DirectDebitMapping>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_direct_debit_mappings"])
            .start_timer();

        let mappings = sqlx::query_as::<_, DirectDebitMapping>(
            r#"
            SELECT mapping_id, user_id, merchant_key, payee, category, subcategory, is_active, created_utc
            FROM direct_debit_mappings
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY merchant_key
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list mappings: {}", e)))?;

        timer.observe_duration();

        Ok(mappings)
    }

    #[instrument(skip(self), fields(user_id = %user_id, merchant_key = %merchant_key))]
    pub async fn get_active_mapping(
        &self,
        user_id: Uuid,
        merchant_key: &str,
    ) -> Result<Option<DirectDebitMapping>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_active_mapping"])
            .start_timer();

        let mapping = sqlx::query_as::<_, DirectDebitMapping>(
            r#"
            SELECT mapping_id, user_id, merchant_key, payee, category, subcategory, is_active, created_utc
            FROM direct_debit_mappings
            WHERE user_id = $1 AND merchant_key = $2 AND is_active = TRUE
            "#,
        )
        .bind(user_id)
        .bind(merchant_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get mapping: {}", e)))?;

        timer.observe_duration();

        Ok(mapping)
    }

    // =========================================================================
    // Anomaly Operations
    // =========================================================================

    /// Insert an anomaly unless an identical open one already exists, so a
    /// re-sync does not flood the review queue.
    #[instrument(skip(self, detail), fields(account_id = %account_id))]
    pub async fn insert_anomaly(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        detail: &AnomalyDetail,
    ) -> Result<Option<Anomaly>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_anomaly"])
            .start_timer();

        let detail_json = serde_json::to_value(detail)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Invalid anomaly detail: {}", e)))?;

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT anomaly_id FROM anomalies
            WHERE account_id = $1 AND kind = $2 AND detail = $3 AND resolved = FALSE
            "#,
        )
        .bind(account_id)
        .bind(detail.kind().as_str())
        .bind(&detail_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check anomaly: {}", e)))?;

        if existing.is_some() {
            timer.observe_duration();
            return Ok(None);
        }

        let anomaly = sqlx::query_as::<_, Anomaly>(
            r#"
            INSERT INTO anomalies (anomaly_id, user_id, account_id, kind, detail)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING anomaly_id, user_id, account_id, kind, detail, resolved, detected_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(account_id)
        .bind(detail.kind().as_str())
        .bind(&detail_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert anomaly: {}", e)))?;

        timer.observe_duration();
        info!(anomaly_id = %anomaly.anomaly_id, kind = %anomaly.kind, "Anomaly recorded");

        Ok(Some(anomaly))
    }

    /// The review queue: open anomalies for a user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list_open_anomalies(&self, user_id: Uuid) -> Result<Vec<Anomaly>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_anomalies"])
            .start_timer();

        let anomalies = sqlx::query_as::<_, Anomaly>(
            r#"
            SELECT anomaly_id, user_id, account_id, kind, detail, resolved, detected_utc
            FROM anomalies
            WHERE user_id = $1 AND resolved = FALSE
            ORDER BY detected_utc
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list anomalies: {}", e)))?;

        timer.observe_duration();

        Ok(anomalies)
    }

    #[instrument(skip(self), fields(anomaly_id = %anomaly_id))]
    pub async fn resolve_anomaly(&self, anomaly_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_anomaly"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE anomalies
            SET resolved = TRUE
            WHERE anomaly_id = $1
            "#,
        )
        .bind(anomaly_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to resolve anomaly: {}", e)))?;

        timer.observe_duration();

        Ok(())
    }
}

/// Map a Postgres unique violation to `Conflict`, everything else to
/// `DatabaseError`.
fn map_unique_violation(e: sqlx::Error, conflict_message: &str) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some("23505") {
            return AppError::Conflict(anyhow::anyhow!("{}", conflict_message));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{}", e))
}
