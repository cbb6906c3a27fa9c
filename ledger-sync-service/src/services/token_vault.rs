//! Token vault: per-connection OAuth credentials with proactive refresh.
//!
//! Refresh tokens are single-use at most providers: two concurrent refresh
//! exchanges for one connection would invalidate it. Refresh is therefore
//! serialized per connection id, and losers of the race re-read the rotated
//! pair instead of spending the stale refresh token.

use crate::services::metrics::TOKEN_REFRESHES;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use secrecy::Secret;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Token triple as persisted for a connection.
#[derive(Debug, Clone)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_utc: DateTime<Utc>,
}

/// A fresh pair from the provider's token endpoint. `refresh_token` is
/// `None` when the provider does not rotate it.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
}

/// Outcome of a refresh exchange.
#[derive(Debug)]
pub enum RefreshError {
    /// The institution rejected the refresh token (revoked access). Terminal
    /// for the connection; never retried automatically.
    Rejected { reason: String },
    /// Transient upstream failure; retry on a later tick.
    Upstream(AppError),
}

/// Storage seam for connection tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_tokens(&self, connection_id: Uuid) -> Result<StoredTokens, AppError>;

    async fn save_tokens(
        &self,
        connection_id: Uuid,
        access_token: &str,
        refresh_token: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn mark_auth_expired(&self, connection_id: Uuid, reason: &str) -> Result<(), AppError>;
}

/// Refresh exchange seam, implemented by the bank-feed client.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}

pub struct TokenVault {
    store: Arc<dyn TokenStore>,
    refresher: Arc<dyn TokenRefresher>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    min_validity: Duration,
}

impl TokenVault {
    pub fn new(
        store: Arc<dyn TokenStore>,
        refresher: Arc<dyn TokenRefresher>,
        min_validity_secs: i64,
    ) -> Self {
        Self {
            store,
            refresher,
            locks: DashMap::new(),
            min_validity: Duration::seconds(min_validity_secs),
        }
    }

    /// Return an access token valid for at least the configured minimum.
    ///
    /// Refreshes proactively when the cached token expires sooner. Safe to
    /// race: concurrent callers for one connection perform a single refresh
    /// exchange between them.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn get_valid_token(
        &self,
        connection_id: Uuid,
    ) -> Result<Secret<String>, AppError> {
        let tokens = self.store.load_tokens(connection_id).await?;
        if self.still_valid(&tokens) {
            return Ok(Secret::new(tokens.access_token));
        }

        let lock = self
            .locks
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A racing caller may have refreshed while this one waited.
        let tokens = self.store.load_tokens(connection_id).await?;
        if self.still_valid(&tokens) {
            return Ok(Secret::new(tokens.access_token));
        }

        match self.refresher.refresh(&tokens.refresh_token).await {
            Ok(pair) => {
                let expires_utc = Utc::now() + Duration::seconds(pair.expires_in_secs);
                let refresh_token = pair
                    .refresh_token
                    .as_deref()
                    .unwrap_or(&tokens.refresh_token);
                self.store
                    .save_tokens(connection_id, &pair.access_token, refresh_token, expires_utc)
                    .await?;

                TOKEN_REFRESHES.with_label_values(&["success"]).inc();
                info!(connection_id = %connection_id, "Access token refreshed");

                Ok(Secret::new(pair.access_token))
            }
            Err(RefreshError::Rejected { reason }) => {
                TOKEN_REFRESHES.with_label_values(&["rejected"]).inc();
                warn!(connection_id = %connection_id, reason = %reason, "Refresh token rejected");
                self.store
                    .mark_auth_expired(connection_id, &reason)
                    .await?;
                Err(AppError::AuthExpired {
                    connection_id,
                    reason,
                })
            }
            Err(RefreshError::Upstream(e)) => {
                TOKEN_REFRESHES.with_label_values(&["upstream_error"]).inc();
                Err(e)
            }
        }
    }

    fn still_valid(&self, tokens: &StoredTokens) -> bool {
        tokens.expires_utc - Utc::now() > self.min_validity
    }
}

// Database-backed store used in production.
mod store_impl {
    use super::{StoredTokens, TokenStore};
    use crate::models::ConnectionStatus;
    use crate::services::database::Database;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use service_core::error::AppError;
    use uuid::Uuid;

    #[async_trait]
    impl TokenStore for Database {
        async fn load_tokens(&self, connection_id: Uuid) -> Result<StoredTokens, AppError> {
            let connection = self
                .get_connection(connection_id)
                .await?
                .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("connection not found")))?;
            Ok(StoredTokens {
                access_token: connection.access_token,
                refresh_token: connection.refresh_token,
                expires_utc: connection.token_expires_utc,
            })
        }

        async fn save_tokens(
            &self,
            connection_id: Uuid,
            access_token: &str,
            refresh_token: &str,
            expires_utc: DateTime<Utc>,
        ) -> Result<(), AppError> {
            self.update_connection_tokens(connection_id, access_token, refresh_token, expires_utc)
                .await
        }

        async fn mark_auth_expired(
            &self,
            connection_id: Uuid,
            reason: &str,
        ) -> Result<(), AppError> {
            self.set_connection_status(connection_id, ConnectionStatus::Expired, Some(reason))
                .await
        }
    }
}
