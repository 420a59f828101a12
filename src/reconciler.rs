use crate::errors::AppResult;
use crate::gateways::{CacheGateway, LedgerGateway};
use crate::models::{ApiKeyRef, CheckItem, CheckResult, CheckScope, Dimension, ItemKind, TaskConfig};
use crate::policy::ThresholdPolicy;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DEFAULT_FANOUT: usize = 16;

#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<dyn CacheGateway>,
    ledger: Arc<dyn LedgerGateway>,
    fanout: usize,
    pinned_now: Option<DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(
        cache: Arc<dyn CacheGateway>,
        ledger: Arc<dyn LedgerGateway>,
        fanout: usize,
    ) -> Self {
        Self {
            cache,
            ledger,
            fanout: fanout.max(1),
            pinned_now: None,
        }
    }

    /// Stamps every result with a fixed instant instead of the wall clock.
    pub fn pinned_at(mut self, now: DateTime<Utc>) -> Self {
        self.pinned_now = Some(now);
        self
    }

    /// Read-only comparison pass. Any gateway failure aborts the run.
    pub async fn check_all(
        &self,
        scope: &CheckScope,
        config: &TaskConfig,
    ) -> AppResult<CheckResult> {
        let policy = ThresholdPolicy::snapshot(config);
        let timestamp = self.pinned_now.unwrap_or_else(Utc::now);

        let keys = self.keys_in_scope(scope).await?;
        let dimensions = dimensions_in_scope(scope);
        let pairs = keys
            .iter()
            .flat_map(|key| {
                dimensions
                    .iter()
                    .map(move |dimension| (key.clone(), *dimension))
            })
            .collect::<Vec<_>>();

        tracing::debug!(keys = keys.len(), pairs = pairs.len(), "starting consistency check");

        let observations = stream::iter(pairs)
            .map(|(key, dimension)| async move {
                let (cached, ledger) = tokio::try_join!(
                    self.cache.get(&key.id, dimension),
                    self.ledger.get_authoritative(&key.id, dimension)
                )?;
                AppResult::Ok(policy.classify(&key, dimension, cached, ledger))
            })
            .buffered(self.fanout)
            .try_collect::<Vec<_>>()
            .await?;

        let items = observations.into_iter().flatten().collect::<Vec<_>>();
        Ok(summarize(timestamp, keys.len() as u32, items))
    }

    async fn keys_in_scope(&self, scope: &CheckScope) -> AppResult<Vec<ApiKeyRef>> {
        let active = self.ledger.list_active_keys().await?;
        let Some(wanted) = &scope.key_ids else {
            return Ok(active);
        };
        let wanted = wanted.iter().map(String::as_str).collect::<BTreeSet<_>>();
        Ok(active
            .into_iter()
            .filter(|key| wanted.contains(key.id.as_str()))
            .collect())
    }
}

fn dimensions_in_scope(scope: &CheckScope) -> Vec<Dimension> {
    match &scope.dimensions {
        Some(dimensions) => {
            let unique = dimensions.iter().copied().collect::<BTreeSet<_>>();
            Dimension::ALL
                .into_iter()
                .filter(|dimension| unique.contains(dimension))
                .collect()
        }
        None => Dimension::ALL.to_vec(),
    }
}

pub fn summarize(
    timestamp: DateTime<Utc>,
    total_keys_checked: u32,
    items: Vec<CheckItem>,
) -> CheckResult {
    // fold from +0.0; an empty f64 `sum` yields -0.0
    let total_difference_usd = items.iter().fold(0.0, |acc, item| acc + item.difference);
    let rates = items
        .iter()
        .filter_map(|item| item.difference_rate)
        .collect::<Vec<_>>();
    let average_difference_rate = if rates.is_empty() {
        0.0
    } else {
        rates.iter().fold(0.0, |acc, rate| acc + rate) / rates.len() as f64
    };
    let cache_miss_count = items
        .iter()
        .filter(|item| item.kind == ItemKind::CacheMiss)
        .count() as u32;

    CheckResult {
        timestamp,
        total_keys_checked,
        inconsistent_count: items.len() as u32,
        cache_miss_count,
        total_difference_usd,
        average_difference_rate,
        items,
    }
}
