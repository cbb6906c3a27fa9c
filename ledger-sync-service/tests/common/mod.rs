//! Common test utilities for DB-backed integration tests.
//!
//! These tests need a disposable Postgres database. They skip (pass
//! vacuously) when `TEST_DATABASE_URL` is unset so `cargo test` stays green
//! without infrastructure.

#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use ledger_sync_service::models::{NewSourceRecord, SourceType};
use ledger_sync_service::services::Database;
use rust_decimal::Decimal;
use std::sync::Once;
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,ledger_sync_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Connect to the test database and apply migrations, or `None` to skip.
pub async fn test_db() -> Option<Database> {
    init_tracing();

    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping DB-backed test");
            return None;
        }
    };

    let db = Database::new(&url, 2, 1).await.expect("connect to test db");
    db.run_migrations().await.expect("apply migrations");
    Some(db)
}

/// A fresh user with a unique email, the ownership boundary for one test.
pub async fn fresh_user(db: &Database) -> Uuid {
    db.create_user(&format!("user-{}@example.test", Uuid::new_v4()))
        .await
        .expect("create user")
}

/// A connection plus one account for bank-sourced records.
pub async fn fresh_account(db: &Database, user_id: Uuid) -> (Uuid, Uuid) {
    let connection = db
        .create_connection(
            user_id,
            "inst-test",
            "access-token",
            "refresh-token",
            Utc::now() + Duration::hours(1),
            "whsec-test",
        )
        .await
        .expect("create connection");

    let account = db
        .upsert_account(
            connection.connection_id,
            user_id,
            "acc-ext-1",
            "GBP",
            Decimal::ZERO,
            None,
        )
        .await
        .expect("create account");

    (connection.connection_id, account.account_id)
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn bank_record(
    external_id: &str,
    account_id: Uuid,
    amount: Decimal,
    merchant: &str,
    occurred: &str,
) -> NewSourceRecord {
    NewSourceRecord {
        source_type: SourceType::BankFeed,
        external_id: external_id.to_string(),
        account_id: Some(account_id),
        amount,
        currency: "GBP".to_string(),
        occurred_utc: at(occurred),
        merchant_raw: merchant.to_string(),
        line_items: None,
    }
}

pub fn receipt_record(
    external_id: &str,
    amount: Decimal,
    merchant: &str,
    occurred: &str,
) -> NewSourceRecord {
    NewSourceRecord {
        source_type: SourceType::EmailReceipt,
        external_id: external_id.to_string(),
        account_id: None,
        amount,
        currency: "GBP".to_string(),
        occurred_utc: at(occurred),
        merchant_raw: merchant.to_string(),
        line_items: None,
    }
}
