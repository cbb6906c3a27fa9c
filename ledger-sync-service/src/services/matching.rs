//! Matching engine: links normalized source records to canonical
//! transactions.
//!
//! The cascade is an ordered list of rules evaluated in sequence, short-
//! circuiting on the first confident result:
//!
//! 1. external-id replay (a record matched in a prior run keeps its link)
//! 2. direct-debit pinned match (bypasses fuzzy comparison entirely)
//! 3. amount+date+merchant fuzzy match
//! 4. no candidate: bank-sourced records seed a new transaction, everything
//!    else stays unmatched until corroborating bank evidence arrives
//!
//! A wrong merge corrupts the ledger, so ambiguity (more than one fuzzy
//! candidate above threshold) is surfaced and never silently resolved.

use crate::config::MatchingConfig;
use crate::models::{
    Direction, MatchRecord, MatchRule, MatchState, SourceRecord, SourceType, Transaction,
    TransactionMetadata,
};
use crate::services::database::Database;
use crate::services::metrics::MATCH_OUTCOMES;
use crate::services::normalizer::{self, NormalizedMerchant};
use chrono::{Duration, NaiveDate};
use service_core::error::AppError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Result of running the cascade over one source record.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The record was matched in a prior run; the link is returned unchanged.
    AlreadyMatched {
        transaction_id: Uuid,
        rule: MatchRule,
    },
    /// Linked to an existing transaction.
    Linked {
        transaction_id: Uuid,
        rule: MatchRule,
        confidence: f64,
    },
    /// A new transaction was seeded from this (bank-sourced) record.
    Created { transaction_id: Uuid },
    /// More than one candidate cleared the threshold; held for review.
    Ambiguous { candidate_ids: Vec<Uuid> },
    /// Non-bank record with no candidate; waiting for bank evidence.
    Deferred,
}

impl MatchOutcome {
    fn metric_labels(&self) -> (&'static str, &'static str) {
        match self {
            Self::AlreadyMatched { rule, .. } => ("already_matched", rule.as_str()),
            Self::Linked { rule, .. } => ("linked", rule.as_str()),
            Self::Created { .. } => ("created", "seed"),
            Self::Ambiguous { .. } => ("ambiguous", "fuzzy"),
            Self::Deferred => ("deferred", "none"),
        }
    }
}

/// Snapshot of a candidate transaction for pure fuzzy evaluation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub transaction_id: Uuid,
    pub occurred_on: NaiveDate,
    pub merchant_tokens: BTreeSet<String>,
    /// Source types already contributing to this transaction. A record never
    /// links to a transaction that already holds evidence of its own type:
    /// two bank debits are two purchases, and a bank debit takes at most one
    /// receipt and one order.
    pub contributing_types: BTreeSet<String>,
}

impl Candidate {
    pub fn from_transaction(t: &Transaction) -> Self {
        Self {
            transaction_id: t.transaction_id,
            occurred_on: t.occurred_on,
            merchant_tokens: normalizer::normalize(&t.merchant_name).tokens,
            contributing_types: t
                .metadata
                .source_refs
                .iter()
                .map(|r| r.source_type.clone())
                .collect(),
        }
    }
}

/// Pure fuzzy decision over a pre-filtered candidate set.
#[derive(Debug, Clone, PartialEq)]
pub enum FuzzyDecision {
    Linked { transaction_id: Uuid, confidence: f64 },
    Ambiguous { candidate_ids: Vec<Uuid> },
    NoCandidate,
}

/// Evaluate the fuzzy rule. Candidates are assumed amount-filtered already;
/// this applies the same-source exclusion, the date window, and the merchant
/// similarity threshold. Exactly one survivor links; several surface as
/// ambiguous.
pub fn evaluate_fuzzy(
    record_tokens: &BTreeSet<String>,
    record_type: SourceType,
    record_date: NaiveDate,
    window_days: i64,
    similarity_threshold: f64,
    candidates: &[Candidate],
) -> FuzzyDecision {
    let mut cleared: Vec<(Uuid, f64, NaiveDate)> = Vec::new();

    for candidate in candidates {
        if candidate
            .contributing_types
            .contains(record_type.as_str())
        {
            continue;
        }

        let delta_days = (candidate.occurred_on - record_date).num_days().abs();
        if delta_days > window_days {
            continue;
        }

        let sim = normalizer::similarity(record_tokens, &candidate.merchant_tokens);
        if sim < similarity_threshold {
            continue;
        }

        // Confidence is similarity scaled by date proximity: a same-day hit
        // keeps the full similarity, the window edge keeps half of it.
        let date_factor = 1.0 - (delta_days as f64 / (window_days + 1) as f64) * 0.5;
        cleared.push((candidate.transaction_id, sim * date_factor, candidate.occurred_on));
    }

    match cleared.len() {
        0 => FuzzyDecision::NoCandidate,
        1 => FuzzyDecision::Linked {
            transaction_id: cleared[0].0,
            confidence: cleared[0].1,
        },
        _ => {
            cleared.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            });
            FuzzyDecision::Ambiguous {
                candidate_ids: cleared.into_iter().map(|(id, _, _)| id).collect(),
            }
        }
    }
}

/// The matching engine. Same-account matching is serialized by the sync
/// worker (one job per connection at a time), so candidate reads and match
/// writes here never race for an account.
pub struct MatchingEngine {
    db: Arc<Database>,
    policy: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(db: Arc<Database>, policy: MatchingConfig) -> Self {
        Self { db, policy }
    }

    /// Run the cascade over one source record and persist the outcome.
    ///
    /// Idempotent: a record with an existing match short-circuits at rule 1
    /// with no writes.
    #[instrument(skip(self, record), fields(record_id = %record.record_id, source_type = %record.source_type))]
    pub async fn match_record(&self, record: &SourceRecord) -> Result<MatchOutcome, AppError> {
        let outcome = self.run_cascade(record).await?;

        let (outcome_label, rule_label) = outcome.metric_labels();
        MATCH_OUTCOMES
            .with_label_values(&[outcome_label, rule_label])
            .inc();

        Ok(outcome)
    }

    async fn run_cascade(&self, record: &SourceRecord) -> Result<MatchOutcome, AppError> {
        // Rule 1: external-id replay.
        if let Some(existing) = self.try_replay(record).await? {
            return Ok(existing);
        }

        let merchant = normalizer::normalize(&record.merchant_raw);

        // Rule 2: direct-debit pinned match.
        if let Some(outcome) = self.try_direct_debit(record, &merchant).await? {
            return Ok(outcome);
        }

        // Rule 3: fuzzy amount+date+merchant.
        if let Some(outcome) = self.try_fuzzy(record, &merchant).await? {
            return Ok(outcome);
        }

        // Rule 4: no candidate.
        self.seed_or_defer(record, &merchant).await
    }

    async fn try_replay(&self, record: &SourceRecord) -> Result<Option<MatchOutcome>, AppError> {
        let existing = self.db.get_match_for_record(record.record_id).await?;
        Ok(existing.map(|m: MatchRecord| {
            debug!(record_id = %record.record_id, transaction_id = %m.transaction_id, "Replay: existing match kept");
            MatchOutcome::AlreadyMatched {
                transaction_id: m.transaction_id,
                rule: m.rule(),
            }
        }))
    }

    async fn try_direct_debit(
        &self,
        record: &SourceRecord,
        merchant: &NormalizedMerchant,
    ) -> Result<Option<MatchOutcome>, AppError> {
        // Mappings pin recurring *bank* merchant strings; annotation sources
        // fall through to the fuzzy rule.
        if !record.source_type().is_bank_sourced() {
            return Ok(None);
        }

        let Some(mapping) = self
            .db
            .get_active_mapping(record.user_id, &merchant.key)
            .await?
        else {
            return Ok(None);
        };

        let mut metadata = TransactionMetadata::default();
        metadata.add_source_ref(record.source_type(), &record.external_id);

        let transaction = self
            .db
            .create_transaction(
                record.user_id,
                record.account_id,
                record.amount.abs(),
                Direction::from_amount(record.amount),
                record.occurred_utc.date_naive(),
                &mapping.payee,
                &metadata,
            )
            .await?;

        // The pinned category is authoritative, not provisional.
        self.db
            .update_transaction_enrichment(
                transaction.transaction_id,
                &mapping.category,
                mapping.subcategory.as_deref(),
                false,
                &metadata,
            )
            .await?;

        self.db
            .create_match(
                record.record_id,
                transaction.transaction_id,
                MatchRule::DirectDebit,
                1.0,
            )
            .await?;
        self.db
            .set_record_match_state(
                record.record_id,
                MatchState::Matched,
                Some(transaction.transaction_id),
            )
            .await?;

        info!(
            record_id = %record.record_id,
            transaction_id = %transaction.transaction_id,
            payee = %mapping.payee,
            "Direct debit pinned match"
        );

        Ok(Some(MatchOutcome::Linked {
            transaction_id: transaction.transaction_id,
            rule: MatchRule::DirectDebit,
            confidence: 1.0,
        }))
    }

    async fn try_fuzzy(
        &self,
        record: &SourceRecord,
        merchant: &NormalizedMerchant,
    ) -> Result<Option<MatchOutcome>, AppError> {
        let window_days = match record.source_type() {
            SourceType::MarketplaceOrder => self.policy.order_date_window_days,
            _ => self.policy.date_window_days,
        };

        let record_date = record.occurred_utc.date_naive();
        let date_from = record_date - Duration::days(window_days);
        let date_to = record_date + Duration::days(window_days);
        let amount_abs = record.amount.abs();
        let tolerance = self.policy.amount_tolerance;

        let transactions = self
            .db
            .find_candidate_transactions(
                record.user_id,
                Direction::from_amount(record.amount),
                date_from,
                date_to,
                amount_abs - tolerance,
                amount_abs + tolerance,
            )
            .await?;

        let candidates: Vec<Candidate> =
            transactions.iter().map(Candidate::from_transaction).collect();

        match evaluate_fuzzy(
            &merchant.tokens,
            record.source_type(),
            record_date,
            window_days,
            self.policy.similarity_threshold,
            &candidates,
        ) {
            FuzzyDecision::Linked {
                transaction_id,
                confidence,
            } => {
                let transaction = transactions
                    .iter()
                    .find(|t| t.transaction_id == transaction_id)
                    .ok_or_else(|| {
                        AppError::InternalError(anyhow::anyhow!(
                            "fuzzy winner missing from candidate set"
                        ))
                    })?;
                self.link(record, transaction, confidence).await?;
                Ok(Some(MatchOutcome::Linked {
                    transaction_id,
                    rule: MatchRule::Fuzzy,
                    confidence,
                }))
            }
            FuzzyDecision::Ambiguous { candidate_ids } => {
                warn!(
                    record_id = %record.record_id,
                    candidates = candidate_ids.len(),
                    "Ambiguous match held for review"
                );
                self.db
                    .set_record_match_state(record.record_id, MatchState::Ambiguous, None)
                    .await?;
                Ok(Some(MatchOutcome::Ambiguous { candidate_ids }))
            }
            FuzzyDecision::NoCandidate => Ok(None),
        }
    }

    /// Link a record to an existing transaction: merge its evidence into the
    /// transaction metadata without redefining the canonical amount, unless
    /// this record is the first bank-feed evidence, which is authoritative.
    async fn link(
        &self,
        record: &SourceRecord,
        transaction: &Transaction,
        confidence: f64,
    ) -> Result<(), AppError> {
        let mut metadata = transaction.metadata.0.clone();

        let had_bank_feed = metadata
            .source_refs
            .iter()
            .any(|r| r.source_type == SourceType::BankFeed.as_str());
        if record.source_type() == SourceType::BankFeed && !had_bank_feed {
            self.db
                .update_transaction_amount(
                    transaction.transaction_id,
                    record.amount.abs(),
                    Direction::from_amount(record.amount),
                )
                .await?;
        }

        metadata.add_source_ref(record.source_type(), &record.external_id);
        if let Some(items) = &record.line_items {
            for item in items.0.iter() {
                if !metadata.line_items.contains(item) {
                    metadata.line_items.push(item.clone());
                }
            }
        }
        self.db
            .update_transaction_metadata(transaction.transaction_id, &metadata)
            .await?;

        self.db
            .create_match(
                record.record_id,
                transaction.transaction_id,
                MatchRule::Fuzzy,
                confidence,
            )
            .await?;
        self.db
            .set_record_match_state(
                record.record_id,
                MatchState::Matched,
                Some(transaction.transaction_id),
            )
            .await?;

        info!(
            record_id = %record.record_id,
            transaction_id = %transaction.transaction_id,
            confidence = confidence,
            "Fuzzy match linked"
        );

        Ok(())
    }

    async fn seed_or_defer(
        &self,
        record: &SourceRecord,
        merchant: &NormalizedMerchant,
    ) -> Result<MatchOutcome, AppError> {
        if !record.source_type().is_bank_sourced() {
            // Non-bank records never fabricate a transaction: the canonical
            // amount must originate from the account ledger.
            debug!(record_id = %record.record_id, "No bank candidate; deferring");
            return Ok(MatchOutcome::Deferred);
        }

        let mut metadata = TransactionMetadata::default();
        metadata.add_source_ref(record.source_type(), &record.external_id);

        let display = if merchant.display.is_empty() {
            record.merchant_raw.clone()
        } else {
            merchant.display.clone()
        };

        let transaction = self
            .db
            .create_transaction(
                record.user_id,
                record.account_id,
                record.amount.abs(),
                Direction::from_amount(record.amount),
                record.occurred_utc.date_naive(),
                &display,
                &metadata,
            )
            .await?;

        self.db
            .create_match(
                record.record_id,
                transaction.transaction_id,
                MatchRule::ExternalIdReplay,
                1.0,
            )
            .await?;
        self.db
            .set_record_match_state(
                record.record_id,
                MatchState::Matched,
                Some(transaction.transaction_id),
            )
            .await?;

        Ok(MatchOutcome::Created {
            transaction_id: transaction.transaction_id,
        })
    }

    /// Resolve an ambiguous (or unmatched) record by hand. The reviewer
    /// picks the transaction; the engine records the link with rule
    /// `manual` and full confidence.
    #[instrument(skip(self), fields(record_id = %record_id, transaction_id = %transaction_id))]
    pub async fn link_manually(
        &self,
        record_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<MatchRecord, AppError> {
        let record = self
            .db
            .get_source_record(record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("source record not found")))?;
        let transaction = self
            .db
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("transaction not found")))?;

        if record.user_id != transaction.user_id {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "record and transaction belong to different users"
            )));
        }
        if self.db.get_match_for_record(record_id).await?.is_some() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "record is already matched"
            )));
        }

        let mut metadata = transaction.metadata.0.clone();
        metadata.add_source_ref(record.source_type(), &record.external_id);
        if let Some(items) = &record.line_items {
            for item in items.0.iter() {
                if !metadata.line_items.contains(item) {
                    metadata.line_items.push(item.clone());
                }
            }
        }
        self.db
            .update_transaction_metadata(transaction_id, &metadata)
            .await?;

        let m = self
            .db
            .create_match(record_id, transaction_id, MatchRule::Manual, 1.0)
            .await?;
        self.db
            .set_record_match_state(record_id, MatchState::Matched, Some(transaction_id))
            .await?;

        MATCH_OUTCOMES.with_label_values(&["linked", "manual"]).inc();

        Ok(m)
    }

    /// Retry every unmatched record for a user. Called after a bank batch
    /// lands so receipts and orders that arrived first find their bank
    /// evidence.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn match_pending_records(&self, user_id: Uuid) -> Result<u32, AppError> {
        let pending = self.db.list_unmatched_records(user_id).await?;
        let mut linked = 0;

        for record in &pending {
            match self.match_record(record).await? {
                MatchOutcome::Linked { .. } | MatchOutcome::Created { .. } => linked += 1,
                _ => {}
            }
        }

        Ok(linked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(raw: &str) -> BTreeSet<String> {
        normalizer::normalize(raw).tokens
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn candidate(id: Uuid, merchant: &str, on: &str, types: &[SourceType]) -> Candidate {
        Candidate {
            transaction_id: id,
            occurred_on: date(on),
            merchant_tokens: tokens(merchant),
            contributing_types: types.iter().map(|t| t.as_str().to_string()).collect(),
        }
    }

    #[test]
    fn single_candidate_links_with_scaled_confidence() {
        let id = Uuid::new_v4();
        let candidates = vec![candidate(
            id,
            "TESCO STORES #12",
            "2025-03-10",
            &[SourceType::BankFeed],
        )];

        let decision = evaluate_fuzzy(
            &tokens("TESCO STORES LONDON"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &candidates,
        );

        match decision {
            FuzzyDecision::Linked {
                transaction_id,
                confidence,
            } => {
                assert_eq!(transaction_id, id);
                assert!(confidence > 0.5);
            }
            other => panic!("expected link, got {:?}", other),
        }
    }

    #[test]
    fn multiple_candidates_surface_as_ambiguous() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let candidates = vec![
            candidate(a, "TESCO STORES", "2025-03-10", &[SourceType::BankFeed]),
            candidate(b, "TESCO STORES", "2025-03-11", &[SourceType::BankFeed]),
        ];

        let decision = evaluate_fuzzy(
            &tokens("TESCO STORES"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &candidates,
        );

        match decision {
            FuzzyDecision::Ambiguous { candidate_ids } => {
                assert_eq!(candidate_ids.len(), 2);
                // Highest confidence (same-day) first.
                assert_eq!(candidate_ids[0], a);
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn candidate_outside_window_is_ignored() {
        let candidates = vec![candidate(
            Uuid::new_v4(),
            "TESCO STORES",
            "2025-03-20",
            &[SourceType::BankFeed],
        )];

        let decision = evaluate_fuzzy(
            &tokens("TESCO STORES"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &candidates,
        );

        assert_eq!(decision, FuzzyDecision::NoCandidate);
    }

    #[test]
    fn candidate_with_same_source_type_is_excluded() {
        // A second receipt never attaches to a transaction that already has
        // one.
        let candidates = vec![candidate(
            Uuid::new_v4(),
            "TESCO STORES",
            "2025-03-10",
            &[SourceType::BankFeed, SourceType::EmailReceipt],
        )];

        let decision = evaluate_fuzzy(
            &tokens("TESCO STORES"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &candidates,
        );

        assert_eq!(decision, FuzzyDecision::NoCandidate);
    }

    #[test]
    fn dissimilar_merchant_is_below_threshold() {
        let candidates = vec![candidate(
            Uuid::new_v4(),
            "SAINSBURYS LOCAL",
            "2025-03-10",
            &[SourceType::BankFeed],
        )];

        let decision = evaluate_fuzzy(
            &tokens("TESCO STORES"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &candidates,
        );

        assert_eq!(decision, FuzzyDecision::NoCandidate);
    }

    #[test]
    fn confidence_decays_with_date_distance() {
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();

        let near_decision = evaluate_fuzzy(
            &tokens("TESCO"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &[candidate(near, "TESCO", "2025-03-10", &[SourceType::BankFeed])],
        );
        let far_decision = evaluate_fuzzy(
            &tokens("TESCO"),
            SourceType::EmailReceipt,
            date("2025-03-10"),
            3,
            0.5,
            &[candidate(far, "TESCO", "2025-03-13", &[SourceType::BankFeed])],
        );

        let confidence = |d: &FuzzyDecision| match d {
            FuzzyDecision::Linked { confidence, .. } => *confidence,
            other => panic!("expected link, got {:?}", other),
        };

        assert!(confidence(&near_decision) > confidence(&far_decision));
    }
}
