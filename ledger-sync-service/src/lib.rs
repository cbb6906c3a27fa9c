//! Ledger Sync Service - cross-source transaction reconciliation and
//! enrichment.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
