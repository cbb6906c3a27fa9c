//! Marketplace order ingestor.
//!
//! Orders arrive as JSON exports from the marketplace-scraping collaborator.
//! They post days before bank settlement, so the matching engine widens the
//! date window for this source.

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
pub struct OrderPayload {
    pub order_id: String,
    pub marketplace: String,
    /// Seller name when the marketplace exposes it.
    pub seller: Option<String>,
    /// Decimal string, order total including shipping.
    pub total: String,
    pub currency: String,
    pub ordered_at: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Deserialize)]
pub struct OrderItem {
    pub title: String,
    #[serde(default = "one")]
    pub quantity: u32,
    pub price: String,
}

fn one() -> u32 {
    1
}

/// Parse one marketplace order into a normalized record.
pub fn parse_order(payload: &str) -> Result<NewSourceRecord, AppError> {
    let order: OrderPayload =
        serde_json::from_str(payload).map_err(|e| AppError::MalformedSourceRecord {
            source_type: SourceType::MarketplaceOrder.as_str().to_string(),
            external_id: "unknown".to_string(),
            reason: format!("bad payload: {}", e),
        })?;

    let malformed = |reason: String| AppError::MalformedSourceRecord {
        source_type: SourceType::MarketplaceOrder.as_str().to_string(),
        external_id: order.order_id.clone(),
        reason,
    };

    let total = Decimal::from_str(&order.total)
        .map_err(|e| malformed(format!("bad total '{}': {}", order.total, e)))?;

    let occurred_utc = DateTime::parse_from_rfc3339(&order.ordered_at)
        .map_err(|e| malformed(format!("bad timestamp '{}': {}", order.ordered_at, e)))?
        .with_timezone(&Utc);

    let line_items: Vec<LineItem> = order
        .items
        .iter()
        .filter_map(|item| {
            let amount = Decimal::from_str(&item.price).ok()?;
            Some(LineItem {
                description: item.title.clone(),
                quantity: item.quantity,
                amount,
            })
        })
        .collect();

    // The bank statement shows the marketplace, not the seller; lead with it
    // so merchant tokens overlap at matching time.
    let merchant_raw = match &order.seller {
        Some(seller) => format!("{} {}", order.marketplace, seller),
        None => order.marketplace.clone(),
    };

    Ok(NewSourceRecord {
        source_type: SourceType::MarketplaceOrder,
        external_id: order.order_id,
        account_id: None,
        amount: -total.abs(),
        currency: order.currency,
        occurred_utc,
        merchant_raw,
        line_items: if line_items.is_empty() {
            None
        } else {
            Some(line_items)
        },
    })
}

/// Parse a batch of order payloads, skipping malformed ones.
pub fn ingest_orders(payloads: &[String]) -> IngestBatch {
    let mut records = Vec::new();
    let mut skipped = 0;

    for payload in payloads {
        match parse_order(payload) {
            Ok(record) => {
                RECORDS_INGESTED
                    .with_label_values(&["marketplace_order", "ok"])
                    .inc();
                records.push(record);
            }
            Err(e) => {
                RECORDS_INGESTED
                    .with_label_values(&["marketplace_order", "malformed"])
                    .inc();
                warn!(error = %e, "Skipping malformed order");
                skipped += 1;
            }
        }
    }

    IngestBatch {
        records: dedup_by_external_id(records),
        skipped,
    }
}
