use crate::errors::{AppError, AppResult};
use crate::gateways::{CacheGateway, LedgerGateway};
use crate::models::{CheckItem, Dimension, FixAllOutcome, FixFailure, FixedEntry};
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

pub const DEFAULT_FIX_CONCURRENCY: usize = 8;

type PairKey = (String, Dimension);

/// Holds a (key, dimension) slot in the in-flight registry until dropped.
struct InFlightGuard {
    registry: Arc<Mutex<HashSet<PairKey>>>,
    pair: PairKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.registry.lock() {
            in_flight.remove(&self.pair);
        }
    }
}

#[derive(Clone)]
pub struct Fixer {
    cache: Arc<dyn CacheGateway>,
    ledger: Arc<dyn LedgerGateway>,
    in_flight: Arc<Mutex<HashSet<PairKey>>>,
    concurrency: usize,
}

impl Fixer {
    pub fn new(
        cache: Arc<dyn CacheGateway>,
        ledger: Arc<dyn LedgerGateway>,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            ledger,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            concurrency: concurrency.max(1),
        }
    }

    /// Overwrites the cached value with the ledger value read now,
    /// not the one captured at check time.
    pub async fn fix_item(&self, key_id: &str, dimension: Dimension) -> AppResult<FixedEntry> {
        let _guard = self.claim(key_id, dimension)?;

        let previous_value = self.cache.get(key_id, dimension).await?;
        let written_value = self.ledger.get_authoritative(key_id, dimension).await?;
        self.cache.set(key_id, dimension, written_value).await?;

        tracing::info!(
            key_id = %key_id,
            dimension = dimension.as_str(),
            previous = ?previous_value,
            written = written_value,
            "repaired cached cost entry"
        );

        Ok(FixedEntry {
            key_id: key_id.to_string(),
            dimension,
            previous_value,
            written_value,
        })
    }

    /// Fixes each distinct pair independently; failures are reported, not propagated.
    pub async fn fix_all(&self, items: &[CheckItem]) -> FixAllOutcome {
        let mut seen = BTreeSet::new();
        let pairs = items
            .iter()
            .filter(|item| seen.insert((item.key_id.clone(), item.dimension)))
            .map(|item| (item.key_id.clone(), item.dimension))
            .collect::<Vec<_>>();

        let attempted = pairs.len() as u32;
        let results = stream::iter(pairs)
            .map(|(key_id, dimension)| async move {
                let result = self.fix_item(&key_id, dimension).await;
                (key_id, dimension, result)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut outcome = FixAllOutcome {
            attempted,
            ..FixAllOutcome::default()
        };
        for (key_id, dimension, result) in results {
            match result {
                Ok(entry) => outcome.entries.push(entry),
                Err(error) => {
                    tracing::warn!(
                        key_id = %key_id,
                        dimension = dimension.as_str(),
                        error = %error,
                        "skipping cost entry that could not be repaired"
                    );
                    outcome.failures.push(FixFailure {
                        key_id,
                        dimension,
                        kind: error.kind().to_string(),
                        message: error.message().to_string(),
                    });
                }
            }
        }
        outcome.entries.sort_by(|left, right| {
            (&left.key_id, left.dimension).cmp(&(&right.key_id, right.dimension))
        });
        outcome.failures.sort_by(|left, right| {
            (&left.key_id, left.dimension).cmp(&(&right.key_id, right.dimension))
        });
        outcome.fixed = outcome.entries.len() as u32;
        outcome
    }

    pub fn is_in_flight(&self, key_id: &str, dimension: Dimension) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains(&(key_id.to_string(), dimension)))
            .unwrap_or(false)
    }

    fn claim(&self, key_id: &str, dimension: Dimension) -> AppResult<InFlightGuard> {
        let pair = (key_id.to_string(), dimension);
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| AppError::Internal("fix registry mutex poisoned".to_string()))?;
        if !in_flight.insert(pair.clone()) {
            return Err(AppError::ConcurrencyConflict(format!(
                "A fix for key {} ({}) is already in progress",
                key_id,
                dimension.as_str()
            )));
        }
        Ok(InFlightGuard {
            registry: self.in_flight.clone(),
            pair,
        })
    }
}
