//! Email receipt ingestor.
//!
//! Receipts arrive as pre-extracted JSON payloads from the mail-parsing
//! collaborator. Amounts are decimal strings; timestamps RFC 3339.

use crate::models::{LineItem, NewSourceRecord, SourceType};
use crate::services::ingest::{dedup_by_external_id, IngestBatch};
use crate::services::metrics::RECORDS_INGESTED;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct ReceiptPayload {
    pub receipt_id: String,
    pub merchant: String,
    /// Decimal string, e.g. "42.50". Always positive; receipts are debits.
    pub total: String,
    pub currency: String,
    pub purchased_at: String,
    #[serde(default)]
    pub items: Vec<ReceiptItem>,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptItem {
    pub description: String,
    #[serde(default = "one")]
    pub quantity: u32,
    pub amount: String,
}

fn one() -> u32 {
    1
}

/// Parse one receipt payload into a normalized record.
pub fn parse_receipt(payload: &str) -> Result<NewSourceRecord, AppError> {
    let receipt: ReceiptPayload =
        serde_json::from_str(payload).map_err(|e| AppError::MalformedSourceRecord {
            source_type: SourceType::EmailReceipt.as_str().to_string(),
            external_id: "unknown".to_string(),
            reason: format!("bad payload: {}", e),
        })?;

    let malformed = |reason: String| AppError::MalformedSourceRecord {
        source_type: SourceType::EmailReceipt.as_str().to_string(),
        external_id: receipt.receipt_id.clone(),
        reason,
    };

    let total = Decimal::from_str(&receipt.total)
        .map_err(|e| malformed(format!("bad total '{}': {}", receipt.total, e)))?;

    let occurred_utc = DateTime::parse_from_rfc3339(&receipt.purchased_at)
        .map_err(|e| malformed(format!("bad timestamp '{}': {}", receipt.purchased_at, e)))?
        .with_timezone(&Utc);

    let line_items: Vec<LineItem> = receipt
        .items
        .iter()
        .filter_map(|item| {
            let amount = Decimal::from_str(&item.amount).ok()?;
            Some(LineItem {
                description: item.description.clone(),
                quantity: item.quantity,
                amount,
            })
        })
        .collect();

    Ok(NewSourceRecord {
        source_type: SourceType::EmailReceipt,
        external_id: receipt.receipt_id,
        account_id: None,
        // Receipts describe money leaving the account.
        amount: -total.abs(),
        currency: receipt.currency,
        occurred_utc,
        merchant_raw: receipt.merchant,
        line_items: if line_items.is_empty() {
            None
        } else {
            Some(line_items)
        },
    })
}

/// Parse a batch of receipt payloads, skipping malformed ones.
pub fn ingest_receipts(payloads: &[String]) -> IngestBatch {
    let mut records = Vec::new();
    let mut skipped = 0;

    for payload in payloads {
        match parse_receipt(payload) {
            Ok(record) => {
                RECORDS_INGESTED
                    .with_label_values(&["email_receipt", "ok"])
                    .inc();
                records.push(record);
            }
            Err(e) => {
                RECORDS_INGESTED
                    .with_label_values(&["email_receipt", "malformed"])
                    .inc();
                warn!(error = %e, "Skipping malformed receipt");
                skipped += 1;
            }
        }
    }

    IngestBatch {
        records: dedup_by_external_id(records),
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "receipt_id": "rcpt-881",
        "merchant": "Amazon.co.uk",
        "total": "42.50",
        "currency": "GBP",
        "purchased_at": "2025-03-01T10:15:00Z",
        "items": [
            {"description": "USB cable", "quantity": 2, "amount": "12.50"},
            {"description": "Keyboard", "amount": "17.50"}
        ]
    }"#;

    #[test]
    fn parses_receipt_with_line_items() {
        let record = parse_receipt(VALID).unwrap();
        assert_eq!(record.external_id, "rcpt-881");
        assert_eq!(record.amount, Decimal::new(-4250, 2));
        let items = record.line_items.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].quantity, 1);
    }

    #[test]
    fn receipt_amount_is_always_a_debit() {
        let payload = VALID.replace("42.50", "42.50");
        let record = parse_receipt(&payload).unwrap();
        assert!(record.amount.is_sign_negative());
    }

    #[test]
    fn malformed_total_is_rejected() {
        let payload = VALID.replace("\"42.50\"", "\"forty-two\"");
        let err = parse_receipt(&payload).unwrap_err();
        assert!(matches!(err, AppError::MalformedSourceRecord { .. }));
    }

    #[test]
    fn batch_skips_malformed_and_dedups() {
        let bad = VALID.replace("2025-03-01T10:15:00Z", "yesterday");
        let payloads = vec![VALID.to_string(), bad, VALID.to_string()];

        let batch = ingest_receipts(&payloads);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);
    }
}
