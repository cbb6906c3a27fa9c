//! service-core: Shared infrastructure for ledger-sync crates.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod utils;

pub use async_trait;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
