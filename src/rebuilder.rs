use crate::errors::{AppError, AppResult};
use crate::gateways::{CacheGateway, COST_KEY_PATTERN};
use crate::models::RebuildReport;
use std::sync::Arc;

/// Phrase an operator must type to invalidate every cached cost aggregate.
pub const REBUILD_CONFIRMATION: &str = "DELETE ALL COST CACHE";

#[derive(Clone)]
pub struct Rebuilder {
    cache: Arc<dyn CacheGateway>,
}

impl Rebuilder {
    pub fn new(cache: Arc<dyn CacheGateway>) -> Self {
        Self { cache }
    }

    /// Deletes every aggregate cost entry.
    /// Readers recompute lazily from the ledger on the next miss.
    pub async fn global_rebuild(&self, confirmation: &str) -> AppResult<RebuildReport> {
        if confirmation.trim() != REBUILD_CONFIRMATION {
            return Err(AppError::Validation(format!(
                "Global rebuild requires the confirmation phrase \"{}\"",
                REBUILD_CONFIRMATION
            )));
        }

        tracing::warn!(pattern = COST_KEY_PATTERN, "invalidating all cached cost aggregates");
        let outcome = self.cache.delete_matching(COST_KEY_PATTERN).await?;
        let report = RebuildReport {
            deleted: outcome.deleted,
            remaining: outcome.remaining,
        };

        if report.is_partial() {
            tracing::warn!(
                deleted = report.deleted,
                remaining = report.remaining,
                "global rebuild was interrupted; remaining entries will surface in the next check"
            );
        } else {
            tracing::info!(deleted = report.deleted, "global rebuild completed");
        }

        Ok(report)
    }
}
