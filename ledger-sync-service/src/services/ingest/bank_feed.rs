//! Bank-feed provider client.
//!
//! Talks to the aggregator's REST API: OAuth code/refresh exchanges, account
//! listing, and the paginated transactions sync endpoint. The caller stores
//! each page before advancing the cursor, so the cursor never moves past
//! unstored data.

use crate::config::BankFeedConfig;
use crate::models::{NewSourceRecord, SourceType};
use crate::services::ingest::minor_units_to_decimal;
use crate::services::token_vault::{RefreshError, TokenPair, TokenRefresher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Bank-feed client for interacting with the provider API.
#[derive(Clone)]
pub struct BankFeedClient {
    client: Client,
    config: BankFeedConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// An account as reported by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAccount {
    pub account_id: String,
    pub currency: String,
    /// Current balance in minor units.
    pub balance_minor: i64,
    pub balance_as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    accounts: Vec<ProviderAccount>,
}

/// A raw transaction as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTransaction {
    pub transaction_id: String,
    pub account_id: String,
    /// Signed amount in minor units; debits negative.
    pub amount_minor: i64,
    pub currency: String,
    /// RFC 3339 timestamp with offset, as sent by the institution.
    pub posted_at: String,
    pub merchant: String,
}

/// One page of the transactions sync endpoint.
#[derive(Debug, Deserialize)]
pub struct TransactionsPage {
    pub transactions: Vec<ProviderTransaction>,
    pub next_cursor: String,
    pub has_more: bool,
}

impl BankFeedClient {
    pub fn new(config: BankFeedConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self { client, config }
    }

    /// Exchange an OAuth authorization code for the initial token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenPair, AppError> {
        let url = format!("{}/oauth/token", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", self.config.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_api_error(status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Invalid token response: {}", e))
        })?;

        tracing::info!("Authorization code exchanged");

        Ok(TokenPair {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in_secs: token.expires_in,
        })
    }

    /// List the connection's accounts with reported balances.
    pub async fn fetch_accounts(
        &self,
        access_token: &str,
    ) -> Result<Vec<ProviderAccount>, AppError> {
        let url = format!("{}/accounts", self.config.api_base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_api_error(status, &body));
        }

        let parsed: AccountsResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Invalid accounts response: {}", e))
        })?;

        Ok(parsed.accounts)
    }

    /// Fetch one page of the transactions sync feed. `cursor` is opaque;
    /// `None` starts from the beginning of the connection's history.
    pub async fn fetch_transactions_page(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionsPage, AppError> {
        let url = format!("{}/transactions/sync", self.config.api_base_url);

        let mut request = self.client.get(&url).bearer_auth(access_token);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_api_error(status, &body));
        }

        let page: TransactionsPage = serde_json::from_str(&body).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Invalid transactions page: {}", e))
        })?;

        tracing::debug!(
            count = page.transactions.len(),
            has_more = page.has_more,
            "Transactions page fetched"
        );

        Ok(page)
    }
}

/// Normalize one provider transaction: minor units to decimal, timestamp to
/// explicit UTC, account external id resolved to the stored account.
///
/// Naive local timestamps silently shifted dates across midnight here once;
/// the provider timestamp must carry an offset and is converted to UTC.
pub fn normalize_transaction(
    txn: &ProviderTransaction,
    account_ids: &HashMap<String, Uuid>,
) -> Result<NewSourceRecord, AppError> {
    let occurred_utc = DateTime::parse_from_rfc3339(&txn.posted_at)
        .map_err(|e| AppError::MalformedSourceRecord {
            source_type: SourceType::BankFeed.as_str().to_string(),
            external_id: txn.transaction_id.clone(),
            reason: format!("bad timestamp '{}': {}", txn.posted_at, e),
        })?
        .with_timezone(&Utc);

    let account_id = account_ids.get(&txn.account_id).copied().ok_or_else(|| {
        AppError::MalformedSourceRecord {
            source_type: SourceType::BankFeed.as_str().to_string(),
            external_id: txn.transaction_id.clone(),
            reason: format!("unknown account '{}'", txn.account_id),
        }
    })?;

    if txn.merchant.trim().is_empty() {
        return Err(AppError::MalformedSourceRecord {
            source_type: SourceType::BankFeed.as_str().to_string(),
            external_id: txn.transaction_id.clone(),
            reason: "empty merchant".to_string(),
        });
    }

    Ok(NewSourceRecord {
        source_type: SourceType::BankFeed,
        external_id: txn.transaction_id.clone(),
        account_id: Some(account_id),
        amount: minor_units_to_decimal(txn.amount_minor, &txn.currency),
        currency: txn.currency.clone(),
        occurred_utc,
        merchant_raw: txn.merchant.clone(),
        line_items: None,
    })
}

#[async_trait]
impl TokenRefresher for BankFeedClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let url = format!("{}/oauth/token", self.config.api_base_url);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", self.config.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| RefreshError::Upstream(map_transport_error(e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Upstream(map_transport_error(e)))?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let parsed: ProviderErrorBody =
                serde_json::from_str(&body).unwrap_or(ProviderErrorBody {
                    error: None,
                    error_description: None,
                });
            let reason = parsed
                .error_description
                .or(parsed.error)
                .unwrap_or_else(|| format!("refresh rejected with status {}", status));
            return Err(RefreshError::Rejected { reason });
        }

        if !status.is_success() {
            return Err(RefreshError::Upstream(map_api_error(status, &body)));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            RefreshError::Upstream(AppError::InternalError(anyhow::anyhow!(
                "Invalid token response: {}",
                e
            )))
        })?;

        Ok(TokenPair {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in_secs: token.expires_in,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> AppError {
    AppError::UpstreamUnavailable {
        message: if e.is_timeout() {
            format!("request timed out: {}", e)
        } else {
            format!("transport error: {}", e)
        },
        retry_after_secs: None,
    }
}

fn map_api_error(status: StatusCode, body: &str) -> AppError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AppError::UpstreamUnavailable {
            message: "rate limited".to_string(),
            retry_after_secs: Some(60),
        },
        s if s.is_server_error() => AppError::UpstreamUnavailable {
            message: format!("provider returned {}", s),
            retry_after_secs: None,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::UpstreamUnavailable {
            message: "access token rejected; will refresh on next tick".to_string(),
            retry_after_secs: None,
        },
        s => AppError::InternalError(anyhow::anyhow!(
            "provider returned {}: {}",
            s,
            body.chars().take(200).collect::<String>()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_txn(posted_at: &str) -> ProviderTransaction {
        ProviderTransaction {
            transaction_id: "txn-1".to_string(),
            account_id: "acc-1".to_string(),
            amount_minor: -4250,
            currency: "GBP".to_string(),
            posted_at: posted_at.to_string(),
            merchant: "TESCO STORES #3027".to_string(),
        }
    }

    fn account_map() -> HashMap<String, Uuid> {
        HashMap::from([("acc-1".to_string(), Uuid::new_v4())])
    }

    #[test]
    fn normalizes_offset_timestamps_to_utc() {
        // 01:30 in UTC+5 is 20:30 UTC the previous day; a naive parse would
        // land the purchase on the wrong side of midnight.
        let txn = provider_txn("2025-03-01T01:30:00+05:00");
        let record = normalize_transaction(&txn, &account_map()).unwrap();
        assert_eq!(
            record.occurred_utc,
            DateTime::parse_from_rfc3339("2025-02-28T20:30:00Z").unwrap()
        );
    }

    #[test]
    fn converts_minor_units_to_decimal() {
        let txn = provider_txn("2025-03-01T12:00:00Z");
        let record = normalize_transaction(&txn, &account_map()).unwrap();
        assert_eq!(record.amount, rust_decimal::Decimal::new(-4250, 2));
    }

    #[test]
    fn rejects_malformed_timestamp() {
        let txn = provider_txn("01/03/2025");
        let err = normalize_transaction(&txn, &account_map()).unwrap_err();
        assert!(matches!(err, AppError::MalformedSourceRecord { .. }));
    }

    #[test]
    fn rejects_unknown_account() {
        let txn = provider_txn("2025-03-01T12:00:00Z");
        let err = normalize_transaction(&txn, &HashMap::new()).unwrap_err();
        assert!(matches!(err, AppError::MalformedSourceRecord { .. }));
    }
}
