//! Configuration module for ledger-sync-service.

use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct LedgerSyncConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub bank_feed: BankFeedConfig,
    pub matching: MatchingConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Bank-feed provider endpoint and OAuth client credentials.
#[derive(Debug, Clone)]
pub struct BankFeedConfig {
    pub api_base_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub request_timeout_secs: u64,
}

/// Matching policy constants. Thresholds cover currency rounding and
/// order-to-settlement lag; tune empirically via environment.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Candidate window for bank/receipt records, in days either side.
    pub date_window_days: i64,
    /// Wider window for marketplace orders, which post before settlement.
    pub order_date_window_days: i64,
    /// Absolute amount tolerance when comparing records to candidates.
    pub amount_tolerance: Decimal,
    /// Minimum merchant token similarity for a fuzzy link.
    pub similarity_threshold: f64,
    /// Tolerance when comparing computed vs reported account balance.
    pub balance_tolerance: Decimal,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            order_date_window_days: 14,
            amount_tolerance: Decimal::new(5, 2),
            similarity_threshold: 0.5,
            balance_tolerance: Decimal::new(1, 2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of connection sync jobs processed concurrently.
    pub concurrency: usize,
    /// Minimum remaining token validity the vault guarantees, in seconds.
    pub token_min_validity_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            token_min_validity_secs: 60,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl LedgerSyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let matching_defaults = MatchingConfig::default();
        let sync_defaults = SyncConfig::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "ledger-sync-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
            },
            bank_feed: BankFeedConfig {
                api_base_url: env::var("BANK_FEED_API_URL")
                    .unwrap_or_else(|_| "https://api.bankfeed.example.com/v1".to_string()),
                client_id: env::var("BANK_FEED_CLIENT_ID").unwrap_or_default(),
                client_secret: Secret::new(
                    env::var("BANK_FEED_CLIENT_SECRET").unwrap_or_default(),
                ),
                request_timeout_secs: env_parse("BANK_FEED_TIMEOUT_SECS", 30),
            },
            matching: MatchingConfig {
                date_window_days: env_parse(
                    "MATCH_DATE_WINDOW_DAYS",
                    matching_defaults.date_window_days,
                ),
                order_date_window_days: env_parse(
                    "MATCH_ORDER_DATE_WINDOW_DAYS",
                    matching_defaults.order_date_window_days,
                ),
                amount_tolerance: env::var("MATCH_AMOUNT_TOLERANCE")
                    .ok()
                    .and_then(|s| Decimal::from_str(&s).ok())
                    .unwrap_or(matching_defaults.amount_tolerance),
                similarity_threshold: env_parse(
                    "MATCH_SIMILARITY_THRESHOLD",
                    matching_defaults.similarity_threshold,
                ),
                balance_tolerance: env::var("BALANCE_TOLERANCE")
                    .ok()
                    .and_then(|s| Decimal::from_str(&s).ok())
                    .unwrap_or(matching_defaults.balance_tolerance),
            },
            sync: SyncConfig {
                concurrency: env_parse("SYNC_CONCURRENCY", sync_defaults.concurrency),
                token_min_validity_secs: env_parse(
                    "TOKEN_MIN_VALIDITY_SECS",
                    sync_defaults.token_min_validity_secs,
                ),
            },
        })
    }
}
