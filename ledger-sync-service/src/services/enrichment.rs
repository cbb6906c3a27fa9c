//! Enrichment engine: assigns category and subcategory to canonical
//! transactions.
//!
//! CategoryRules apply in priority order, first match wins. Transactions no
//! rule covers fall back to an external classification collaborator and are
//! marked provisional until a rule claims them.

use crate::models::{CategoryRule, RuleMatchType, Transaction};
use crate::services::database::Database;
use crate::services::normalizer;
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// External classification collaborator. Implementations are out of scope;
/// the engine only depends on this seam.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `(category, subcategory)` or `None` when the classifier has
    /// no opinion.
    async fn classify(
        &self,
        merchant: &str,
        amount: Decimal,
    ) -> Result<Option<(String, Option<String>)>, AppError>;
}

/// A rule with its regex compiled once per enrichment pass.
struct CompiledRule<'a> {
    rule: &'a CategoryRule,
    regex: Option<regex::Regex>,
}

fn compile_rules(rules: &[CategoryRule]) -> Vec<CompiledRule<'_>> {
    rules
        .iter()
        .map(|rule| {
            let regex = if rule.match_type() == RuleMatchType::Regex {
                regex::Regex::new(&rule.merchant_pattern).ok()
            } else {
                None
            };
            CompiledRule { rule, regex }
        })
        .collect()
}

/// Apply rules in order against a normalized merchant key and amount.
/// First match wins. Pure.
fn first_matching_rule<'a>(
    compiled: &'a [CompiledRule<'a>],
    merchant_key: &str,
    amount: Decimal,
) -> Option<&'a CategoryRule> {
    for entry in compiled {
        let rule = entry.rule;

        if let Some(min) = rule.min_amount {
            if amount < min {
                continue;
            }
        }
        if let Some(max) = rule.max_amount {
            if amount > max {
                continue;
            }
        }

        let pattern = rule.merchant_pattern.to_lowercase();
        let matches = match rule.match_type() {
            RuleMatchType::Exact => merchant_key == pattern,
            RuleMatchType::Contains => merchant_key.contains(&pattern),
            RuleMatchType::StartsWith => merchant_key.starts_with(&pattern),
            RuleMatchType::EndsWith => merchant_key.ends_with(&pattern),
            RuleMatchType::Regex => entry
                .regex
                .as_ref()
                .map(|r| r.is_match(merchant_key))
                .unwrap_or(false),
        };

        if matches {
            return Some(rule);
        }
    }
    None
}

pub struct EnrichmentEngine {
    db: Arc<Database>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl EnrichmentEngine {
    pub fn new(db: Arc<Database>, classifier: Option<Arc<dyn Classifier>>) -> Self {
        Self { db, classifier }
    }

    /// Enrich every uncategorized or provisional transaction for a user.
    ///
    /// Idempotent: unchanged data and rules yield the same category, and a
    /// transaction already carrying it is not rewritten.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn enrich_user(&self, user_id: Uuid) -> Result<u32, AppError> {
        let rules = self.db.list_rules_for_user(user_id).await?;
        let compiled = compile_rules(&rules);
        let pending = self.db.list_unenriched_transactions(user_id).await?;

        let mut enriched = 0;
        for transaction in &pending {
            if self.enrich_one(&compiled, transaction).await? {
                enriched += 1;
            }
        }

        if enriched > 0 {
            info!(user_id = %user_id, enriched = enriched, "Enrichment pass complete");
        }

        Ok(enriched)
    }

    async fn enrich_one(
        &self,
        compiled: &[CompiledRule<'_>],
        transaction: &Transaction,
    ) -> Result<bool, AppError> {
        let merchant_key = normalizer::normalize(&transaction.merchant_name).key;

        if let Some(rule) = first_matching_rule(compiled, &merchant_key, transaction.amount) {
            let unchanged = transaction.category.as_deref() == Some(rule.category.as_str())
                && transaction.subcategory == rule.subcategory
                && !transaction.provisional;
            if unchanged {
                return Ok(false);
            }

            let mut metadata = transaction.metadata.0.clone();
            metadata.classified_by = None;
            self.db
                .update_transaction_enrichment(
                    transaction.transaction_id,
                    &rule.category,
                    rule.subcategory.as_deref(),
                    false,
                    &metadata,
                )
                .await?;
            debug!(
                transaction_id = %transaction.transaction_id,
                category = %rule.category,
                "Categorized by rule"
            );
            return Ok(true);
        }

        // Provisional results stand until a rule covers the merchant.
        if transaction.category.is_some() {
            return Ok(false);
        }

        let Some(classifier) = &self.classifier else {
            return Ok(false);
        };

        match classifier
            .classify(&transaction.merchant_name, transaction.amount)
            .await
        {
            Ok(Some((category, subcategory))) => {
                let mut metadata = transaction.metadata.0.clone();
                metadata.classified_by = Some(classifier.name().to_string());
                self.db
                    .update_transaction_enrichment(
                        transaction.transaction_id,
                        &category,
                        subcategory.as_deref(),
                        true,
                        &metadata,
                    )
                    .await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                // Classification is best-effort; the transaction stays
                // uncategorized for the next pass.
                warn!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "External classification failed"
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(
        pattern: &str,
        match_type: RuleMatchType,
        category: &str,
        priority: i32,
    ) -> CategoryRule {
        CategoryRule {
            rule_id: Uuid::new_v4(),
            user_id: None,
            merchant_pattern: pattern.to_string(),
            match_type: match_type.as_str().to_string(),
            min_amount: None,
            max_amount: None,
            category: category.to_string(),
            subcategory: None,
            priority,
            is_active: true,
            created_utc: Utc::now(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule("tesco", RuleMatchType::Contains, "Groceries", 1),
            rule("tesco", RuleMatchType::Contains, "Shopping", 2),
        ];
        let compiled = compile_rules(&rules);

        let hit = first_matching_rule(&compiled, "stores tesco", Decimal::new(1200, 2)).unwrap();
        assert_eq!(hit.category, "Groceries");
    }

    #[test]
    fn no_rule_matches_returns_none() {
        let rules = vec![rule("tesco", RuleMatchType::Contains, "Groceries", 1)];
        let compiled = compile_rules(&rules);

        assert!(first_matching_rule(&compiled, "costa coffee", Decimal::ONE).is_none());
    }

    #[test]
    fn amount_range_bounds_the_rule() {
        let mut bounded = rule("uber", RuleMatchType::Contains, "Transport", 1);
        bounded.min_amount = Some(Decimal::new(500, 2));
        bounded.max_amount = Some(Decimal::new(10_000, 2));
        let rules = vec![bounded];
        let compiled = compile_rules(&rules);

        assert!(first_matching_rule(&compiled, "uber", Decimal::new(2_500, 2)).is_some());
        assert!(first_matching_rule(&compiled, "uber", Decimal::new(100, 2)).is_none());
        assert!(first_matching_rule(&compiled, "uber", Decimal::new(99_900, 2)).is_none());
    }

    #[test]
    fn exact_and_regex_match_types() {
        let rules = vec![
            rule("netflix", RuleMatchType::Exact, "Subscriptions", 1),
            rule(r"^rent\b", RuleMatchType::Regex, "Housing", 2),
        ];
        let compiled = compile_rules(&rules);

        assert_eq!(
            first_matching_rule(&compiled, "netflix", Decimal::ONE)
                .unwrap()
                .category,
            "Subscriptions"
        );
        assert_eq!(
            first_matching_rule(&compiled, "rent march", Decimal::ONE)
                .unwrap()
                .category,
            "Housing"
        );
        assert!(first_matching_rule(&compiled, "netflix gift", Decimal::ONE).is_none());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let rules = vec![rule("[invalid(", RuleMatchType::Regex, "Broken", 1)];
        let compiled = compile_rules(&rules);
        assert!(first_matching_rule(&compiled, "anything", Decimal::ONE).is_none());
    }
}
