pub mod ledger;

use crate::errors::{AppError, AppResult};
use crate::models::{
    HistoryDetails, HistoryFilters, HistoryRecord, HistoryStats, OperationType, PageRequest,
    PageResponse, TaskConfig,
};
use crate::policy::validate_task_config;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const TASK_CONFIG_KEY: &str = "reconcile_task";
const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 200;
const MAX_STATS_WINDOW_DAYS: u32 = 365;

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::TransientIo(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_task_config()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Task Config ────────────────────────────────────────────────────────

    pub fn get_task_config(&self) -> AppResult<TaskConfig> {
        let conn = self.lock()?;
        read_task_config(&conn)
    }

    /// Applies a partial JSON update; the merged config is validated before anything is written.
    /// The connection guard is held from read to write so concurrent updates cannot drop fields.
    pub fn update_task_config(&self, update: serde_json::Value) -> AppResult<TaskConfig> {
        if !update.is_object() {
            return Err(AppError::Validation(
                "Task config update must be a JSON object".to_string(),
            ));
        }

        let conn = self.lock()?;
        let current = read_task_config(&conn)?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let mut config: TaskConfig = serde_json::from_value(merged).map_err(|error| {
            AppError::Validation(format!("Malformed task config update: {}", error))
        })?;
        validate_task_config(&config)?;

        let now = Utc::now();
        config.updated_at = Some(now);
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE
             SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![TASK_CONFIG_KEY, serde_json::to_string(&config)?, format_time(now)],
        )?;

        Ok(config)
    }

    fn ensure_default_task_config(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [TASK_CONFIG_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    TASK_CONFIG_KEY,
                    serde_json::to_string(&TaskConfig::default())?,
                    format_time(Utc::now())
                ],
            )?;
        }
        Ok(())
    }

    // ─── Audit History ──────────────────────────────────────────────────────

    pub fn append_history(
        &self,
        operator: &str,
        details: HistoryDetails,
    ) -> AppResult<HistoryRecord> {
        // stamped under the guard so created_at order matches seq order
        let conn = self.lock()?;
        let record = HistoryRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation_type: details.operation_type(),
            operator: operator.to_string(),
            keys_checked: details.keys_checked(),
            inconsistencies_found: details.inconsistencies_found(),
            items_fixed: details.items_fixed(),
            total_difference: format_usd(details.total_difference()),
            details,
        };

        conn.execute(
            "INSERT INTO reconcile_history (
               id, created_at, operation_type, operator, keys_checked,
               inconsistencies_found, items_fixed, total_difference, details_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                format_time(record.timestamp),
                record.operation_type.as_str(),
                record.operator,
                record.keys_checked,
                record.inconsistencies_found,
                record.items_fixed,
                record.total_difference,
                serde_json::to_string(&record.details)?,
            ],
        )?;

        Ok(record)
    }

    pub fn query_history(
        &self,
        filters: &HistoryFilters,
        page: PageRequest,
    ) -> AppResult<PageResponse<HistoryRecord>> {
        let mut clause = String::from(" WHERE 1 = 1");
        let mut params_vec: Vec<String> = Vec::new();

        if let Some(operation_type) = filters.operation_type {
            clause.push_str(" AND operation_type = ?");
            params_vec.push(operation_type.as_str().to_string());
        }
        if let Some(operator) = &filters.operator {
            clause.push_str(" AND operator = ?");
            params_vec.push(operator.clone());
        }
        if let Some(date_from) = filters.date_from {
            clause.push_str(" AND created_at >= ?");
            params_vec.push(format_time(date_from));
        }
        if let Some(date_to) = filters.date_to {
            clause.push_str(" AND created_at <= ?");
            params_vec.push(format_time(date_to));
        }

        let limit = page.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = page.offset.unwrap_or(0);

        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(1) FROM reconcile_history{}", clause),
            rusqlite::params_from_iter(params_vec.iter()),
            |row| row.get(0),
        )?;

        let query = format!(
            "SELECT id, created_at, operation_type, operator, keys_checked, inconsistencies_found,
                    items_fixed, total_difference, details_json
             FROM reconcile_history{} ORDER BY seq DESC LIMIT ? OFFSET ?",
            clause
        );
        let mut statement = conn.prepare(&query)?;
        let mut dyn_params: Vec<&dyn rusqlite::ToSql> = params_vec
            .iter()
            .map(|param| param as &dyn rusqlite::ToSql)
            .collect();
        dyn_params.push(&limit);
        dyn_params.push(&offset);

        let rows = statement.query_map(rusqlite::params_from_iter(dyn_params), parse_history_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        Ok(PageResponse {
            items,
            total: total.max(0) as u64,
            limit,
            offset,
        })
    }

    pub fn aggregate_stats(&self, window_days: u32, now: DateTime<Utc>) -> AppResult<HistoryStats> {
        if !(1..=MAX_STATS_WINDOW_DAYS).contains(&window_days) {
            return Err(AppError::Validation(format!(
                "Stats window {} days is out of allowed range (1..={})",
                window_days, MAX_STATS_WINDOW_DAYS
            )));
        }
        let since = now - Duration::days(i64::from(window_days));

        let conn = self.lock()?;
        let (total_checks, total_inconsistencies, total_fixed): (i64, i64, i64) = conn.query_row(
            "SELECT
               COALESCE(SUM(CASE
                 WHEN operation_type IN ('manual_check', 'scheduled_check', 'auto_fix') THEN 1
                 ELSE 0 END), 0),
               COALESCE(SUM(CASE
                 WHEN operation_type IN ('manual_check', 'scheduled_check', 'auto_fix')
                   THEN inconsistencies_found
                 ELSE 0 END), 0),
               COALESCE(SUM(items_fixed), 0)
             FROM reconcile_history
             WHERE created_at >= ?1 AND created_at <= ?2",
            params![format_time(since), format_time(now)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let fix_rate = if total_inconsistencies > 0 {
            (total_fixed as f64 / total_inconsistencies as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        Ok(HistoryStats {
            window_days,
            total_checks: total_checks.max(0) as u64,
            total_inconsistencies: total_inconsistencies.max(0) as u64,
            total_fixed: total_fixed.max(0) as u64,
            fix_rate,
        })
    }

    /// Completion time of the most recent scheduler-originated run.
    /// Restores the schedule after a restart.
    pub fn latest_scheduled_run_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT created_at FROM reconcile_history
                 WHERE operation_type IN (?1, ?2)
                 ORDER BY seq DESC LIMIT 1",
                params![
                    OperationType::ScheduledCheck.as_str(),
                    OperationType::AutoFix.as_str()
                ],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|raw| parse_time(&raw).map_err(AppError::from)).transpose()
    }
}

fn read_task_config(conn: &Connection) -> AppResult<TaskConfig> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?1",
            [TASK_CONFIG_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match raw {
        Some(raw) => Ok(serde_json::from_str::<TaskConfig>(&raw)?),
        None => Ok(TaskConfig::default()),
    }
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let raw_operation: String = row.get(2)?;
    let operation_type = OperationType::parse(&raw_operation).ok_or_else(|| {
        conversion_error(format!("Unknown operation type '{}'", raw_operation))
    })?;
    let details_json: String = row.get(8)?;
    let details: HistoryDetails =
        serde_json::from_str(&details_json).map_err(|error| conversion_error(error.to_string()))?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        timestamp: parse_time(&row.get::<_, String>(1)?)?,
        operation_type,
        operator: row.get(3)?,
        keys_checked: row.get(4)?,
        inconsistencies_found: row.get(5)?,
        items_fixed: row.get(6)?,
        total_difference: row.get(7)?,
        details,
    })
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Fixed-width UTC timestamps so lexical order in SQLite matches time order.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

pub(crate) fn format_usd(value: f64) -> String {
    // `+ 0.0` turns -0.0 into 0.0
    format!("{:.6}", value + 0.0)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
