//! Card-network export ingestor.
//!
//! Card networks hand users CSV exports with one row per transaction:
//! `reference,posted_at,description,amount,currency`. Amounts are signed
//! decimal major units; `posted_at` is RFC 3339 or a plain date taken as
//! midnight UTC.

use crate::models::{NewSourceRecord, SourceType};
use crate::services::ingest::{dedup_by_external_id, IngestBatch};
use crate::services::metrics::RECORDS_INGESTED;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct CardExportRow {
    reference: String,
    posted_at: String,
    description: String,
    amount: String,
    currency: String,
}

/// Parse a card-network CSV export. Malformed rows are skipped and counted,
/// never aborting the batch.
pub fn ingest_card_export(csv_data: &str, account_id: Option<Uuid>) -> IngestBatch {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let mut records = Vec::new();
    let mut skipped = 0;

    for row in reader.deserialize::<CardExportRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                RECORDS_INGESTED
                    .with_label_values(&["card_export", "malformed"])
                    .inc();
                warn!(error = %e, "Skipping unreadable export row");
                skipped += 1;
                continue;
            }
        };

        match normalize_row(&row, account_id) {
            Ok(record) => {
                RECORDS_INGESTED
                    .with_label_values(&["card_export", "ok"])
                    .inc();
                records.push(record);
            }
            Err(reason) => {
                RECORDS_INGESTED
                    .with_label_values(&["card_export", "malformed"])
                    .inc();
                warn!(reference = %row.reference, reason = %reason, "Skipping malformed export row");
                skipped += 1;
            }
        }
    }

    IngestBatch {
        records: dedup_by_external_id(records),
        skipped,
    }
}

fn normalize_row(row: &CardExportRow, account_id: Option<Uuid>) -> Result<NewSourceRecord, String> {
    if row.reference.is_empty() {
        return Err("empty reference".to_string());
    }

    let amount = Decimal::from_str(&row.amount)
        .map_err(|e| format!("bad amount '{}': {}", row.amount, e))?;

    let occurred_utc = parse_timestamp(&row.posted_at)
        .ok_or_else(|| format!("bad timestamp '{}'", row.posted_at))?;

    if row.description.trim().is_empty() {
        return Err("empty description".to_string());
    }

    Ok(NewSourceRecord {
        source_type: SourceType::CardExport,
        external_id: row.reference.clone(),
        account_id,
        amount,
        currency: row.currency.to_uppercase(),
        occurred_utc,
        merchant_raw: row.description.clone(),
        line_items: None,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "\
reference,posted_at,description,amount,currency
CE-1001,2025-03-01T09:30:00Z,TESCO STORES 3027,-42.50,gbp
CE-1002,2025-03-02,COSTA COFFEE,-3.20,GBP
CE-1003,2025-03-03T14:00:00+01:00,REFUND AMZN,12.00,GBP
";

    #[test]
    fn parses_rows_with_mixed_timestamp_forms() {
        let batch = ingest_card_export(EXPORT, None);
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.skipped, 0);

        assert_eq!(batch.records[0].amount, Decimal::new(-4250, 2));
        assert_eq!(batch.records[0].currency, "GBP");
        // Plain dates land at midnight UTC.
        assert_eq!(
            batch.records[1].occurred_utc,
            DateTime::parse_from_rfc3339("2025-03-02T00:00:00Z").unwrap()
        );
        // Offset timestamps convert to UTC.
        assert_eq!(
            batch.records[2].occurred_utc,
            DateTime::parse_from_rfc3339("2025-03-03T13:00:00Z").unwrap()
        );
    }

    #[test]
    fn malformed_row_is_skipped_not_fatal() {
        let data = "\
reference,posted_at,description,amount,currency
CE-1001,2025-03-01T09:30:00Z,TESCO,-42.50,GBP
CE-1002,not-a-date,COSTA,-3.20,GBP
";
        let batch = ingest_card_export(data, None);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn duplicate_references_collapse() {
        let data = "\
reference,posted_at,description,amount,currency
CE-1001,2025-03-01T09:30:00Z,TESCO,-42.50,GBP
CE-1001,2025-03-01T09:30:00Z,TESCO,-42.50,GBP
";
        let batch = ingest_card_export(data, None);
        assert_eq!(batch.records.len(), 1);
    }
}
