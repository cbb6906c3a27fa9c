//! Consistency checker: validates running balances and flags duplicate
//! transactions after a matching pass.
//!
//! Findings are advisory. Nothing here deletes or corrects data; drift is
//! resolved by re-sync or manual review.

use crate::models::{Account, AnomalyDetail, SourceRecord};
use crate::services::database::Database;
use crate::services::metrics::ANOMALIES_DETECTED;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Snapshot of one ledger entry for pure checking.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub transaction_id: Uuid,
    pub occurred_on: NaiveDate,
    /// Debits negative, credits positive.
    pub signed_amount: Decimal,
    /// External ids of contributing source records.
    pub external_ids: Vec<String>,
}

/// Recompute the running balance and detect duplicates. Pure.
///
/// Duplicate detection requires overlapping contributing external ids on top
/// of equal amount and date; two legitimate same-day purchases at one
/// merchant share neither.
pub fn check_account(
    reported_balance: Decimal,
    tolerance: Decimal,
    entries: &[LedgerEntry],
) -> Vec<AnomalyDetail> {
    let mut findings = Vec::new();

    let computed: Decimal = entries.iter().map(|e| e.signed_amount).sum();
    let difference = computed - reported_balance;
    if difference.abs() > tolerance {
        findings.push(AnomalyDetail::BalanceDrift {
            computed_balance: computed,
            reported_balance,
            difference,
        });
    }

    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let (a, b) = (&entries[i], &entries[j]);
            if a.signed_amount != b.signed_amount || a.occurred_on != b.occurred_on {
                continue;
            }
            let shared: Vec<String> = a
                .external_ids
                .iter()
                .filter(|id| b.external_ids.contains(id))
                .cloned()
                .collect();
            if !shared.is_empty() {
                findings.push(AnomalyDetail::DuplicateTransaction {
                    transaction_id: b.transaction_id,
                    duplicate_of: a.transaction_id,
                    shared_external_ids: shared,
                });
            }
        }
    }

    findings
}

pub struct ConsistencyChecker {
    db: Arc<Database>,
    balance_tolerance: Decimal,
}

impl ConsistencyChecker {
    pub fn new(db: Arc<Database>, balance_tolerance: Decimal) -> Self {
        Self {
            db,
            balance_tolerance,
        }
    }

    /// Check one account and persist any findings as anomalies.
    #[instrument(skip(self, account), fields(account_id = %account.account_id))]
    pub async fn check_account(&self, account: &Account) -> Result<Vec<AnomalyDetail>, AppError> {
        let transactions = self
            .db
            .list_transactions_for_account(account.account_id)
            .await?;

        let ids: Vec<Uuid> = transactions.iter().map(|t| t.transaction_id).collect();
        let records = self.db.list_source_records_for_transactions(&ids).await?;

        let mut by_transaction: HashMap<Uuid, Vec<String>> = HashMap::new();
        for record in &records {
            if let Some(txn_id) = record.transaction_id {
                by_transaction
                    .entry(txn_id)
                    .or_default()
                    .push(external_key(record));
            }
        }

        let entries: Vec<LedgerEntry> = transactions
            .iter()
            .map(|t| LedgerEntry {
                transaction_id: t.transaction_id,
                occurred_on: t.occurred_on,
                signed_amount: t.signed_amount(),
                external_ids: by_transaction
                    .remove(&t.transaction_id)
                    .unwrap_or_default(),
            })
            .collect();

        let findings = check_account(account.reported_balance, self.balance_tolerance, &entries);

        for finding in &findings {
            ANOMALIES_DETECTED
                .with_label_values(&[finding.kind().as_str()])
                .inc();
            self.db
                .insert_anomaly(account.user_id, account.account_id, finding)
                .await?;
        }

        if !findings.is_empty() {
            info!(
                account_id = %account.account_id,
                findings = findings.len(),
                "Consistency findings recorded"
            );
        }

        Ok(findings)
    }
}

fn external_key(record: &SourceRecord) -> String {
    format!("{}:{}", record.source_type, record.external_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnomalyKind;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn entry(amount: i64, on: &str, ids: &[&str]) -> LedgerEntry {
        LedgerEntry {
            transaction_id: Uuid::new_v4(),
            occurred_on: date(on),
            signed_amount: Decimal::new(amount, 2),
            external_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn balanced_account_yields_no_findings() {
        // +1000.00, -50.00, -30.00 -> 920.00
        let entries = vec![
            entry(100_000, "2025-03-01", &["bank_feed:t1"]),
            entry(-5_000, "2025-03-02", &["bank_feed:t2"]),
            entry(-3_000, "2025-03-03", &["bank_feed:t3"]),
        ];

        let findings = check_account(Decimal::new(92_000, 2), Decimal::new(1, 2), &entries);
        assert!(findings.is_empty());
    }

    #[test]
    fn drift_beyond_tolerance_is_reported() {
        let entries = vec![
            entry(100_000, "2025-03-01", &["bank_feed:t1"]),
            entry(-5_000, "2025-03-02", &["bank_feed:t2"]),
            entry(-3_000, "2025-03-03", &["bank_feed:t3"]),
        ];

        let findings = check_account(Decimal::new(85_000, 2), Decimal::new(1, 2), &entries);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind(), AnomalyKind::BalanceDrift);
        match &findings[0] {
            AnomalyDetail::BalanceDrift {
                computed_balance,
                difference,
                ..
            } => {
                assert_eq!(*computed_balance, Decimal::new(92_000, 2));
                assert_eq!(*difference, Decimal::new(7_000, 2));
            }
            other => panic!("unexpected finding {:?}", other),
        }
    }

    #[test]
    fn drift_within_tolerance_is_not_reported() {
        let entries = vec![entry(10_000, "2025-03-01", &["bank_feed:t1"])];
        let findings = check_account(Decimal::new(10_001, 2), Decimal::new(5, 2), &entries);
        assert!(findings.is_empty());
    }

    #[test]
    fn duplicates_require_overlapping_external_ids() {
        // Same amount, same day, disjoint sources: two legitimate coffees.
        let entries = vec![
            entry(-350, "2025-03-01", &["bank_feed:t1"]),
            entry(-350, "2025-03-01", &["bank_feed:t2"]),
        ];

        let findings = check_account(Decimal::new(-700, 2), Decimal::new(1, 2), &entries);
        assert!(findings.is_empty());
    }

    #[test]
    fn overlapping_external_ids_flag_a_duplicate() {
        let a = entry(-350, "2025-03-01", &["bank_feed:t1", "email_receipt:r1"]);
        let b = entry(-350, "2025-03-01", &["email_receipt:r1"]);
        let (a_id, b_id) = (a.transaction_id, b.transaction_id);

        let findings = check_account(Decimal::new(-700, 2), Decimal::new(1, 2), &[a, b]);
        assert_eq!(findings.len(), 1);
        match &findings[0] {
            AnomalyDetail::DuplicateTransaction {
                transaction_id,
                duplicate_of,
                shared_external_ids,
            } => {
                assert_eq!(*transaction_id, b_id);
                assert_eq!(*duplicate_of, a_id);
                assert_eq!(shared_external_ids, &["email_receipt:r1".to_string()]);
            }
            other => panic!("unexpected finding {:?}", other),
        }
    }
}
