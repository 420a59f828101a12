//! Usage ledger tables and the SQLite-backed `LedgerGateway`.
//!
//! Dimension windows are evaluated in UTC: `daily`, `weekly` (ISO, Monday start) and
//! `monthly` are calendar windows, `five_hour` is a rolling window ending now.

use super::{format_time, Database};
use crate::errors::{AppError, AppResult};
use crate::gateways::LedgerGateway;
use crate::models::{ApiKeyRef, Dimension};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rusqlite::params;
use std::sync::Arc;
use uuid::Uuid;

impl Database {
    pub fn upsert_api_key(&self, id: &str, name: &str, active: bool) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO api_keys (id, name, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_active = excluded.is_active",
            params![id, name, active, format_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn record_usage(
        &self,
        key_id: &str,
        cost_usd: f64,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<String> {
        if !cost_usd.is_finite() {
            return Err(AppError::Validation(format!("Usage cost {} is not finite", cost_usd)));
        }
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO usage_records (id, key_id, cost_usd, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, key_id, cost_usd, format_time(recorded_at)],
        )?;
        Ok(id)
    }

    pub fn list_active_api_keys(&self) -> AppResult<Vec<ApiKeyRef>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, name FROM api_keys WHERE is_active = 1 ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ApiKeyRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn sum_usage(
        &self,
        key_id: &str,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> AppResult<f64> {
        let conn = self.lock()?;
        let total: f64 = match since {
            Some(since) => conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
                 WHERE key_id = ?1 AND recorded_at >= ?2 AND recorded_at <= ?3",
                params![key_id, format_time(since), format_time(until)],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_records
                 WHERE key_id = ?1 AND recorded_at <= ?2",
                params![key_id, format_time(until)],
                |row| row.get(0),
            )?,
        };
        Ok(total)
    }
}

/// Inclusive lower bound of a dimension's window; `None` means unbounded.
pub fn window_start(dimension: Dimension, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let midnight = |date: NaiveDate| {
        date.and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
    };
    let today = now.date_naive();
    let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    match dimension {
        Dimension::Total => None,
        Dimension::Daily => midnight(today),
        Dimension::Weekly => midnight(monday),
        Dimension::Monthly => {
            NaiveDate::from_ymd_opt(today.year(), today.month(), 1).and_then(midnight)
        }
        Dimension::FiveHour => Some(now - Duration::hours(5)),
    }
}

pub struct SqliteLedger {
    db: Arc<Database>,
    pinned_now: Option<DateTime<Utc>>,
}

impl SqliteLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, pinned_now: None }
    }

    /// Evaluates every window against a fixed instant instead of the wall clock.
    pub fn pinned_at(db: Arc<Database>, now: DateTime<Utc>) -> Self {
        Self {
            db,
            pinned_now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.pinned_now.unwrap_or_else(Utc::now)
    }
}

fn unavailable(error: AppError) -> AppError {
    match error {
        AppError::Validation(_) => error,
        other => AppError::TransientIo(format!("ledger query failed: {}", other.message())),
    }
}

#[async_trait]
impl LedgerGateway for SqliteLedger {
    async fn list_active_keys(&self) -> AppResult<Vec<ApiKeyRef>> {
        self.db.list_active_api_keys().map_err(unavailable)
    }

    async fn get_authoritative(&self, key_id: &str, dimension: Dimension) -> AppResult<f64> {
        let now = self.now();
        self.db
            .sum_usage(key_id, window_start(dimension, now), now)
            .map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::{window_start, SqliteLedger};
    use crate::db::Database;
    use crate::gateways::LedgerGateway;
    use crate::models::Dimension;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn windows_follow_utc_calendar_boundaries() {
        // Thursday
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 13, 30, 0).single().expect("time");
        assert_eq!(window_start(Dimension::Total, now), None);
        assert_eq!(
            window_start(Dimension::Daily, now),
            Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).single()
        );
        assert_eq!(
            window_start(Dimension::Weekly, now),
            Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).single()
        );
        assert_eq!(
            window_start(Dimension::Monthly, now),
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single()
        );
        assert_eq!(
            window_start(Dimension::FiveHour, now),
            Utc.with_ymd_and_hms(2026, 10, 15, 8, 30, 0).single()
        );
    }

    #[tokio::test]
    async fn ledger_sums_usage_per_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 13, 30, 0).single().expect("time");

        db.upsert_api_key("k1", "primary", true).expect("key");
        db.upsert_api_key("k2", "retired", false).expect("key");
        db.record_usage("k1", 1.25, now - Duration::hours(1)).expect("usage");
        db.record_usage("k1", 2.00, now - Duration::hours(7)).expect("usage");
        db.record_usage("k1", 4.00, now - Duration::days(20)).expect("usage");
        db.record_usage("k1", 9.00, now + Duration::minutes(5)).expect("future usage");

        let ledger = SqliteLedger::pinned_at(db.clone(), now);
        let keys = ledger.list_active_keys().await.expect("keys");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].name, "primary");

        let five_hour = ledger.get_authoritative("k1", Dimension::FiveHour).await.expect("5h");
        let daily = ledger.get_authoritative("k1", Dimension::Daily).await.expect("daily");
        let total = ledger.get_authoritative("k1", Dimension::Total).await.expect("total");
        assert!((five_hour - 1.25).abs() < 1e-9);
        assert!((daily - 3.25).abs() < 1e-9);
        assert!((total - 7.25).abs() < 1e-9);
        assert_eq!(ledger.get_authoritative("missing", Dimension::Total).await.expect("none"), 0.0);
    }
}
