//! Domain models for ledger-sync-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Bank Connection Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Active,
    Expired,
    Revoked,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "expired" => Self::Expired,
            "revoked" => Self::Revoked,
            "error" => Self::Error,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BankConnection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub institution_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_utc: DateTime<Utc>,
    pub sync_cursor: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub webhook_secret: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl BankConnection {
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: Uuid,
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub external_id: String,
    pub currency: String,
    pub reported_balance: Decimal,
    pub balance_as_of_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

// ============================================================================
// Source Record Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    BankFeed,
    EmailReceipt,
    MarketplaceOrder,
    CardExport,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BankFeed => "bank_feed",
            Self::EmailReceipt => "email_receipt",
            Self::MarketplaceOrder => "marketplace_order",
            Self::CardExport => "card_export",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "bank_feed" => Self::BankFeed,
            "email_receipt" => Self::EmailReceipt,
            "marketplace_order" => Self::MarketplaceOrder,
            "card_export" => Self::CardExport,
            _ => Self::BankFeed,
        }
    }

    /// Bank-feed and card-export records carry authoritative amounts from
    /// the account ledger; receipts and orders only annotate.
    pub fn is_bank_sourced(&self) -> bool {
        matches!(self, Self::BankFeed | Self::CardExport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Unmatched,
    Matched,
    Ambiguous,
}

impl MatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::Ambiguous => "ambiguous",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "unmatched" => Self::Unmatched,
            "matched" => Self::Matched,
            "ambiguous" => Self::Ambiguous,
            _ => Self::Unmatched,
        }
    }
}

/// One purchase line inside a receipt or marketplace order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub amount: Decimal,
}

#[derive(Debug, Clone, FromRow)]
pub struct SourceRecord {
    pub record_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub source_type: String,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_utc: DateTime<Utc>,
    pub merchant_raw: String,
    pub line_items: Option<Json<Vec<LineItem>>>,
    pub match_state: String,
    pub transaction_id: Option<Uuid>,
    pub ingested_utc: DateTime<Utc>,
}

impl SourceRecord {
    pub fn source_type(&self) -> SourceType {
        SourceType::from_str(&self.source_type)
    }

    pub fn match_state(&self) -> MatchState {
        MatchState::from_str(&self.match_state)
    }
}

/// A normalized record produced by an ingestor, not yet stored.
#[derive(Debug, Clone)]
pub struct NewSourceRecord {
    pub source_type: SourceType,
    pub external_id: String,
    pub account_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_utc: DateTime<Utc>,
    pub merchant_raw: String,
    pub line_items: Option<Vec<LineItem>>,
}

// ============================================================================
// Transaction Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "debit" => Self::Debit,
            "credit" => Self::Credit,
            _ => Self::Debit,
        }
    }

    /// Direction of a signed amount: negative amounts are debits.
    pub fn from_amount(amount: Decimal) -> Self {
        if amount.is_sign_negative() {
            Self::Debit
        } else {
            Self::Credit
        }
    }
}

/// Structured enrichment metadata. Stored as JSONB with typed fields so
/// downstream equality and consistency checks never compare opaque text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// External ids of contributing source records, keyed by source type.
    #[serde(default)]
    pub source_refs: Vec<SourceRef>,
    /// Line items merged in from receipts/orders.
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    /// Name of the external classifier that produced a provisional category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: String,
    pub external_id: String,
}

impl TransactionMetadata {
    /// Record a contributing source if not already present.
    pub fn add_source_ref(&mut self, source_type: SourceType, external_id: &str) {
        let type_str = source_type.as_str();
        if !self
            .source_refs
            .iter()
            .any(|r| r.source_type == type_str && r.external_id == external_id)
        {
            self.source_refs.push(SourceRef {
                source_type: type_str.to_string(),
                external_id: external_id.to_string(),
            });
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Option<Uuid>,
    pub amount: Decimal,
    pub direction: String,
    pub occurred_on: NaiveDate,
    pub merchant_name: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub provisional: bool,
    pub metadata: Json<TransactionMetadata>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Transaction {
    pub fn direction(&self) -> Direction {
        Direction::from_str(&self.direction)
    }

    /// Signed amount for balance arithmetic: debits negative, credits positive.
    pub fn signed_amount(&self) -> Decimal {
        match self.direction() {
            Direction::Debit => -self.amount.abs(),
            Direction::Credit => self.amount.abs(),
        }
    }
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    ExternalIdReplay,
    DirectDebit,
    Fuzzy,
    Manual,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalIdReplay => "external_id_replay",
            Self::DirectDebit => "direct_debit",
            Self::Fuzzy => "fuzzy",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "external_id_replay" => Self::ExternalIdReplay,
            "direct_debit" => Self::DirectDebit,
            "fuzzy" => Self::Fuzzy,
            "manual" => Self::Manual,
            _ => Self::Fuzzy,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MatchRecord {
    pub match_id: Uuid,
    pub record_id: Uuid,
    pub transaction_id: Uuid,
    pub rule: String,
    pub confidence: f64,
    pub matched_utc: DateTime<Utc>,
}

impl MatchRecord {
    pub fn rule(&self) -> MatchRule {
        MatchRule::from_str(&self.rule)
    }
}

// ============================================================================
// Category Rule Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatchType {
    Contains,
    Exact,
    Regex,
    StartsWith,
    EndsWith,
}

impl RuleMatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Exact => "exact",
            Self::Regex => "regex",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "contains" => Self::Contains,
            "exact" => Self::Exact,
            "regex" => Self::Regex,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            _ => Self::Contains,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CategoryRule {
    pub rule_id: Uuid,
    pub user_id: Option<Uuid>,
    pub merchant_pattern: String,
    pub match_type: String,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub category: String,
    pub subcategory: Option<String>,
    pub priority: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl CategoryRule {
    pub fn match_type(&self) -> RuleMatchType {
        RuleMatchType::from_str(&self.match_type)
    }
}

// ============================================================================
// Direct Debit Mapping Models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct DirectDebitMapping {
    pub mapping_id: Uuid,
    pub user_id: Uuid,
    pub merchant_key: String,
    pub payee: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Anomaly Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    BalanceDrift,
    DuplicateTransaction,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BalanceDrift => "balance_drift",
            Self::DuplicateTransaction => "duplicate_transaction",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "balance_drift" => Self::BalanceDrift,
            "duplicate_transaction" => Self::DuplicateTransaction,
            _ => Self::BalanceDrift,
        }
    }
}

/// Typed anomaly payloads, serialized as JSONB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyDetail {
    BalanceDrift {
        computed_balance: Decimal,
        reported_balance: Decimal,
        difference: Decimal,
    },
    DuplicateTransaction {
        transaction_id: Uuid,
        duplicate_of: Uuid,
        shared_external_ids: Vec<String>,
    },
}

impl AnomalyDetail {
    pub fn kind(&self) -> AnomalyKind {
        match self {
            Self::BalanceDrift { .. } => AnomalyKind::BalanceDrift,
            Self::DuplicateTransaction { .. } => AnomalyKind::DuplicateTransaction,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub kind: String,
    pub detail: Json<AnomalyDetail>,
    pub resolved: bool,
    pub detected_utc: DateTime<Utc>,
}

impl Anomaly {
    pub fn kind(&self) -> AnomalyKind {
        AnomalyKind::from_str(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_amount_sign() {
        assert_eq!(
            Direction::from_amount(Decimal::new(-4250, 2)),
            Direction::Debit
        );
        assert_eq!(
            Direction::from_amount(Decimal::new(100000, 2)),
            Direction::Credit
        );
    }

    #[test]
    fn metadata_source_refs_deduplicate() {
        let mut meta = TransactionMetadata::default();
        meta.add_source_ref(SourceType::EmailReceipt, "rcpt-1");
        meta.add_source_ref(SourceType::EmailReceipt, "rcpt-1");
        meta.add_source_ref(SourceType::MarketplaceOrder, "ord-9");
        assert_eq!(meta.source_refs.len(), 2);
    }

    #[test]
    fn anomaly_detail_round_trips_as_typed_json() {
        let detail = AnomalyDetail::BalanceDrift {
            computed_balance: Decimal::new(92000, 2),
            reported_balance: Decimal::new(85000, 2),
            difference: Decimal::new(7000, 2),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "balance_drift");
        let back: AnomalyDetail = serde_json::from_value(json).unwrap();
        assert_eq!(back, detail);
    }
}
