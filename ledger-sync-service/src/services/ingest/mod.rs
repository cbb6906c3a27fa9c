//! Source ingestors: one per upstream format, each normalizing raw upstream
//! records into `NewSourceRecord` batches.
//!
//! Contract shared by all ingestors: batches are deduplicated by external id
//! before they are returned (upstream APIs redeliver), malformed records are
//! skipped and counted without aborting the batch, and amounts/timestamps
//! are normalized (decimal major units, explicit UTC) at ingestion.

pub mod bank_feed;
pub mod card_export;
pub mod order;
pub mod receipt;

use crate::models::NewSourceRecord;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// A normalized batch plus the number of records skipped as malformed.
#[derive(Debug, Default)]
pub struct IngestBatch {
    pub records: Vec<NewSourceRecord>,
    pub skipped: u32,
}

/// Drop in-batch duplicates by external id, keeping the first occurrence.
pub fn dedup_by_external_id(records: Vec<NewSourceRecord>) -> Vec<NewSourceRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.external_id.clone()))
        .collect()
}

/// Convert an integer minor-unit amount to decimal major units using the
/// currency's exponent. Storing naive minor units was a recurring source of
/// hundred-fold errors; every ingestor converts at the boundary.
pub fn minor_units_to_decimal(minor: i64, currency: &str) -> Decimal {
    let exponent = match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" => 0,
        "BHD" | "KWD" | "OMR" | "TND" => 3,
        _ => 2,
    };
    Decimal::new(minor, exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::Utc;

    fn record(external_id: &str) -> NewSourceRecord {
        NewSourceRecord {
            source_type: SourceType::BankFeed,
            external_id: external_id.to_string(),
            account_id: None,
            amount: Decimal::new(-100, 2),
            currency: "GBP".to_string(),
            occurred_utc: Utc::now(),
            merchant_raw: "TEST".to_string(),
            line_items: None,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let records = vec![record("a"), record("b"), record("a")];
        let deduped = dedup_by_external_id(records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].external_id, "a");
        assert_eq!(deduped[1].external_id, "b");
    }

    #[test]
    fn minor_units_respect_currency_exponent() {
        assert_eq!(
            minor_units_to_decimal(-4250, "GBP"),
            Decimal::new(-4250, 2)
        );
        assert_eq!(minor_units_to_decimal(5000, "JPY"), Decimal::new(5000, 0));
        assert_eq!(minor_units_to_decimal(12345, "KWD"), Decimal::new(12345, 3));
    }
}
