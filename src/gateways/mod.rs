pub mod memory;

use crate::errors::AppResult;
use crate::models::{ApiKeyRef, Dimension};
use async_trait::async_trait;

pub const COST_KEY_PREFIX: &str = "usage:cost";
/// Matches every aggregate cost entry regardless of dimension or key.
pub const COST_KEY_PATTERN: &str = "usage:cost:*";

pub fn cost_cache_key(key_id: &str, dimension: Dimension) -> String {
    format!("{}:{}:{}", COST_KEY_PREFIX, dimension.as_str(), key_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: u64,
    /// Matching entries still present when the gateway stopped deleting.
    pub remaining: u64,
}

/// Read/write access to cached per-key, per-dimension cost totals.
#[async_trait]
pub trait CacheGateway: Send + Sync {
    async fn get(&self, key_id: &str, dimension: Dimension) -> AppResult<Option<f64>>;

    async fn set(&self, key_id: &str, dimension: Dimension, value: f64) -> AppResult<()>;

    async fn delete_matching(&self, pattern: &str) -> AppResult<DeleteOutcome>;
}

/// Read-only access to authoritative totals.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn list_active_keys(&self) -> AppResult<Vec<ApiKeyRef>>;

    async fn get_authoritative(&self, key_id: &str, dimension: Dimension) -> AppResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::{cost_cache_key, COST_KEY_PATTERN};
    use crate::models::Dimension;

    #[test]
    fn cache_keys_share_the_rebuild_prefix() {
        let key = cost_cache_key("k-1", Dimension::FiveHour);
        assert_eq!(key, "usage:cost:five_hour:k-1");
        assert!(key.starts_with(COST_KEY_PATTERN.trim_end_matches('*')));
    }
}
