//! Direct-debit mapper: user-curated pinned pairings between recurring bank
//! merchant strings and a payee/category, consumed by matching rule 2.

use crate::models::DirectDebitMapping;
use crate::services::database::Database;
use crate::services::normalizer;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct DirectDebitMapper {
    db: Arc<Database>,
}

impl DirectDebitMapper {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Pin a merchant. The raw string is normalized to the same key the
    /// matching engine derives, so the mapping fires on every future
    /// occurrence regardless of reference-number noise. One active mapping
    /// per normalized merchant per user; a second returns `Conflict`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn create(
        &self,
        user_id: Uuid,
        raw_merchant: &str,
        payee: &str,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<DirectDebitMapping, AppError> {
        let merchant = normalizer::normalize(raw_merchant);
        if merchant.key.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "merchant '{}' normalizes to nothing",
                raw_merchant
            )));
        }
        if payee.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("payee is required")));
        }

        let mapping = self
            .db
            .create_direct_debit_mapping(user_id, &merchant.key, payee, category, subcategory)
            .await?;

        info!(
            mapping_id = %mapping.mapping_id,
            merchant_key = %mapping.merchant_key,
            "Direct debit pinned"
        );

        Ok(mapping)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<DirectDebitMapping>, AppError> {
        self.db.list_direct_debit_mappings(user_id).await
    }

    /// Deactivate rather than delete, preserving match history audit.
    #[instrument(skip(self), fields(mapping_id = %mapping_id))]
    pub async fn deactivate(&self, mapping_id: Uuid) -> Result<(), AppError> {
        self.db.deactivate_direct_debit_mapping(mapping_id).await
    }
}
