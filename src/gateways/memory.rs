//! In-process cache gateway used for single-node deployments and tests.

use super::{cost_cache_key, CacheGateway, DeleteOutcome};
use crate::errors::{AppError, AppResult};
use crate::models::Dimension;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, f64>>,
    available: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the backing cache going away; every call fails with `TransientIo` until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Raw write used by live application paths that bypass the reconciler.
    pub async fn insert_raw(&self, key: String, value: f64) {
        self.entries.write().await.insert(key, value);
    }

    fn ensure_available(&self) -> AppResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::TransientIo("cache backend unreachable".to_string()))
        }
    }
}

#[async_trait]
impl CacheGateway for MemoryCache {
    async fn get(&self, key_id: &str, dimension: Dimension) -> AppResult<Option<f64>> {
        self.ensure_available()?;
        let entries = self.entries.read().await;
        Ok(entries.get(&cost_cache_key(key_id, dimension)).copied())
    }

    async fn set(&self, key_id: &str, dimension: Dimension, value: f64) -> AppResult<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(cost_cache_key(key_id, dimension), value);
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> AppResult<DeleteOutcome> {
        self.ensure_available()?;
        let matcher = glob_to_regex(pattern)?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        Ok(DeleteOutcome {
            deleted: (before - entries.len()) as u64,
            remaining: 0,
        })
    }
}

/// Translates a Redis-style glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> AppResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|error| {
        AppError::Validation(format!("Invalid key pattern '{}': {}", pattern, error))
    })
}
