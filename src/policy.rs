use crate::errors::{AppError, AppResult};
use crate::models::{ApiKeyRef, CheckItem, Dimension, ItemKind, TaskConfig, ALLOWED_INTERVAL_HOURS};

/// Floor for the rate denominator so tiny ledger totals cannot blow the rate up to infinity.
pub const RATE_EPSILON_USD: f64 = 1e-9;
const MAX_THRESHOLD_USD: f64 = 1_000_000.0;
const MAX_THRESHOLD_RATE: f64 = 10_000.0;

/// Thresholds captured once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub threshold_usd: f64,
    pub threshold_rate: f64,
}

impl ThresholdPolicy {
    pub fn snapshot(config: &TaskConfig) -> Self {
        Self {
            threshold_usd: config.threshold_usd,
            threshold_rate: config.threshold_rate,
        }
    }

    /// Returns the item to report for this pair, or `None` when it is consistent.
    pub fn classify(
        &self,
        key: &ApiKeyRef,
        dimension: Dimension,
        cached_value: Option<f64>,
        ledger_value: f64,
    ) -> Option<CheckItem> {
        let difference = (cached_value.unwrap_or(0.0) - ledger_value).abs();
        let difference_rate = difference_rate(difference, ledger_value);

        // an absent entry is always a miss, even when the ledger would recompute it as zero
        let kind = match cached_value {
            None => ItemKind::CacheMiss,
            Some(_) => {
                let over_usd = difference > self.threshold_usd;
                let over_rate = difference_rate
                    .map(|rate| rate > self.threshold_rate)
                    .unwrap_or(false);
                if !over_usd && !over_rate {
                    return None;
                }
                ItemKind::Drift
            }
        };

        Some(CheckItem {
            key_id: key.id.clone(),
            key_name: key.name.clone(),
            dimension,
            kind,
            cached_value,
            ledger_value,
            difference,
            difference_rate,
        })
    }
}

pub fn difference_rate(difference: f64, ledger_value: f64) -> Option<f64> {
    if ledger_value == 0.0 {
        return None;
    }
    Some(difference / ledger_value.abs().max(RATE_EPSILON_USD) * 100.0)
}

pub fn validate_task_config(config: &TaskConfig) -> AppResult<()> {
    if !ALLOWED_INTERVAL_HOURS.contains(&config.interval_hours) {
        return Err(AppError::Validation(format!(
            "Interval {}h is not allowed (expected one of {:?})",
            config.interval_hours, ALLOWED_INTERVAL_HOURS
        )));
    }

    if !config.threshold_usd.is_finite()
        || !(0.0..=MAX_THRESHOLD_USD).contains(&config.threshold_usd)
    {
        return Err(AppError::Validation(format!(
            "thresholdUsd {} is out of allowed range (0..={})",
            config.threshold_usd, MAX_THRESHOLD_USD
        )));
    }

    if !config.threshold_rate.is_finite()
        || !(0.0..=MAX_THRESHOLD_RATE).contains(&config.threshold_rate)
    {
        return Err(AppError::Validation(format!(
            "thresholdRate {} is out of allowed range (0..={})",
            config.threshold_rate, MAX_THRESHOLD_RATE
        )));
    }

    Ok(())
}
