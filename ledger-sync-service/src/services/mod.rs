//! Service layer: persistence, reconciliation engines, and orchestration.

pub mod consistency;
pub mod database;
pub mod direct_debit;
pub mod enrichment;
pub mod ingest;
pub mod matching;
pub mod metrics;
pub mod normalizer;
pub mod sync;
pub mod token_vault;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
