use crate::db::ledger::SqliteLedger;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::fixer::{Fixer, DEFAULT_FIX_CONCURRENCY};
use crate::gateways::{CacheGateway, LedgerGateway};
use crate::models::{
    AutoFixDetails, CheckItem, CheckResult, CheckScope, Dimension, FixAllOutcome, FixedEntry,
    HistoryDetails, HistoryFilters, HistoryRecord, HistoryStats, OperationType, PageRequest,
    PageResponse, RebuildReport, RebuildRequest, RunFailure, RunOutcome, RunSummary, RunTrigger,
    ScheduledCheckDetails, TaskConfig, TaskStatus,
};
use crate::rebuilder::Rebuilder;
use crate::reconciler::{Reconciler, DEFAULT_FANOUT};
use crate::scheduler::{ReconcileScheduler, DEFAULT_TICK};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub tick: Duration,
    pub fanout: usize,
    pub fix_concurrency: usize,
    /// Fixed check timestamp for reproducible results; `None` uses the wall clock.
    pub pinned_now: Option<DateTime<Utc>>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            fanout: DEFAULT_FANOUT,
            fix_concurrency: DEFAULT_FIX_CONCURRENCY,
            pinned_now: None,
        }
    }
}

#[derive(Clone)]
pub struct ReconcileCore {
    db: Arc<Database>,
    reconciler: Reconciler,
    fixer: Fixer,
    rebuilder: Rebuilder,
    scheduler: ReconcileScheduler,
}

impl ReconcileCore {
    /// Opens the state database under `data_dir` and reads the ledger from the same store.
    pub fn new(
        data_dir: PathBuf,
        cache: Arc<dyn CacheGateway>,
        options: ServiceOptions,
    ) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(&data_dir.join("state.sqlite"))?);
        let ledger: Arc<dyn LedgerGateway> = Arc::new(SqliteLedger::new(db.clone()));
        Self::with_gateways(db, cache, ledger, options)
    }

    pub fn with_gateways(
        db: Arc<Database>,
        cache: Arc<dyn CacheGateway>,
        ledger: Arc<dyn LedgerGateway>,
        options: ServiceOptions,
    ) -> AppResult<Arc<Self>> {
        let last_run = db.latest_scheduled_run_at()?;
        let scheduler = ReconcileScheduler::new(options.tick, last_run);
        let mut reconciler = Reconciler::new(cache.clone(), ledger.clone(), options.fanout);
        if let Some(now) = options.pinned_now {
            reconciler = reconciler.pinned_at(now);
        }

        let this = Arc::new(Self {
            db,
            reconciler,
            fixer: Fixer::new(cache.clone(), ledger, options.fix_concurrency),
            rebuilder: Rebuilder::new(cache),
            scheduler: scheduler.clone(),
        });

        let weak = Arc::downgrade(&this);
        scheduler.set_executor(Arc::new(move |trigger: RunTrigger, operator: String| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(strong) => strong.execute_scheduled_run(trigger, operator).await,
                    None => detached_summary(trigger),
                }
            })
        }));

        let weak = Arc::downgrade(&this);
        scheduler.set_config_source(Arc::new(move || match weak.upgrade() {
            Some(strong) => strong.db.get_task_config(),
            None => Err(AppError::Internal("reconcile core has been dropped".to_string())),
        }));

        Ok(this)
    }

    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ─── Operator Actions ───────────────────────────────────────────────────

    pub async fn check_all(
        &self,
        scope: Option<CheckScope>,
        operator: &str,
    ) -> AppResult<CheckResult> {
        let config = self.db.get_task_config()?;
        let result = self
            .reconciler
            .check_all(&scope.unwrap_or_default(), &config)
            .await?;
        self.db
            .append_history(operator, HistoryDetails::ManualCheck(result.clone()))?;
        tracing::info!(
            operator = %operator,
            keys = result.total_keys_checked,
            inconsistencies = result.inconsistent_count,
            misses = result.cache_miss_count,
            "manual consistency check completed"
        );
        Ok(result)
    }

    pub async fn fix_item(
        &self,
        key_id: &str,
        dimension: Dimension,
        operator: &str,
    ) -> AppResult<FixedEntry> {
        if key_id.trim().is_empty() {
            return Err(AppError::Validation("keyId must not be empty".to_string()));
        }
        let entry = self.fixer.fix_item(key_id, dimension).await?;
        let outcome = FixAllOutcome {
            attempted: 1,
            fixed: 1,
            entries: vec![entry.clone()],
            failures: Vec::new(),
        };
        self.db.append_history(operator, HistoryDetails::ManualFix(outcome))?;
        Ok(entry)
    }

    pub async fn fix_all(&self, items: &[CheckItem], operator: &str) -> AppResult<FixAllOutcome> {
        if items.is_empty() {
            return Ok(FixAllOutcome::default());
        }
        let outcome = self.fixer.fix_all(items).await;
        self.db
            .append_history(operator, HistoryDetails::ManualFix(outcome.clone()))?;
        if outcome.failed_entirely() {
            tracing::warn!(
                operator = %operator,
                attempted = outcome.attempted,
                "no cost entries could be repaired"
            );
        }
        Ok(outcome)
    }

    pub async fn global_rebuild(
        &self,
        request: RebuildRequest,
        operator: &str,
    ) -> AppResult<RebuildReport> {
        let report = self.rebuilder.global_rebuild(&request.confirmation).await?;
        self.db.append_history(operator, HistoryDetails::GlobalRebuild(report))?;
        tracing::warn!(
            operator = %operator,
            deleted = report.deleted,
            remaining = report.remaining,
            "global cost cache rebuild recorded"
        );
        Ok(report)
    }

    pub fn get_status(&self) -> AppResult<TaskStatus> {
        let config = self.db.get_task_config()?;
        self.scheduler.status(&config)
    }

    pub async fn trigger_now(&self, operator: &str) -> AppResult<RunSummary> {
        self.scheduler.trigger_now(operator).await
    }

    // ─── Config & History ───────────────────────────────────────────────────

    pub fn get_config(&self) -> AppResult<TaskConfig> {
        self.db.get_task_config()
    }

    pub fn update_config(&self, update: serde_json::Value) -> AppResult<TaskConfig> {
        let updated = self.db.update_task_config(update)?;
        tracing::info!(
            enabled = updated.enabled,
            interval_hours = updated.interval_hours,
            auto_fix = updated.auto_fix,
            "reconcile task config updated"
        );
        self.scheduler.wake();
        Ok(updated)
    }

    pub fn list_history(
        &self,
        filters: HistoryFilters,
        page: PageRequest,
    ) -> AppResult<PageResponse<HistoryRecord>> {
        self.db.query_history(&filters, page)
    }

    pub fn history_stats(&self, window_days: u32) -> AppResult<HistoryStats> {
        self.db.aggregate_stats(window_days, Utc::now())
    }

    // ─── Scheduled Runs ─────────────────────────────────────────────────────

    async fn execute_scheduled_run(&self, trigger: RunTrigger, operator: String) -> RunSummary {
        let started_at = Utc::now();
        let details = match self.scheduled_check().await {
            Ok(details) => details,
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    trigger = ?trigger,
                    "scheduled consistency check failed"
                );
                HistoryDetails::ScheduledCheck(ScheduledCheckDetails::Failed(RunFailure {
                    kind: error.kind().to_string(),
                    message: error.message().to_string(),
                }))
            }
        };

        let error = match &details {
            HistoryDetails::ScheduledCheck(ScheduledCheckDetails::Failed(failure)) => {
                Some(failure.message.clone())
            }
            _ => None,
        };
        let mut summary = RunSummary {
            trigger,
            outcome: if error.is_some() {
                RunOutcome::Failed
            } else {
                RunOutcome::Completed
            },
            operation_type: details.operation_type(),
            started_at,
            finished_at: Utc::now(),
            keys_checked: details.keys_checked(),
            inconsistencies_found: details.inconsistencies_found(),
            items_fixed: details.items_fixed(),
            error,
        };

        match self.db.append_history(&operator, details) {
            Ok(record) => summary.finished_at = record.timestamp,
            Err(error) => {
                tracing::error!(error = %error, "failed to record scheduled run in audit history");
                summary.outcome = RunOutcome::Failed;
                summary.error = Some(error.to_string());
            }
        }
        summary
    }

    async fn scheduled_check(&self) -> AppResult<HistoryDetails> {
        let config = self.db.get_task_config()?;
        let check = self.reconciler.check_all(&CheckScope::default(), &config).await?;
        if !config.auto_fix || check.items.is_empty() {
            return Ok(HistoryDetails::ScheduledCheck(ScheduledCheckDetails::Completed(check)));
        }

        let fix = self.fixer.fix_all(&check.items).await;
        tracing::info!(attempted = fix.attempted, fixed = fix.fixed, "auto-fix applied");
        Ok(HistoryDetails::AutoFix(AutoFixDetails { check, fix }))
    }
}

fn detached_summary(trigger: RunTrigger) -> RunSummary {
    let now = Utc::now();
    RunSummary {
        trigger,
        outcome: RunOutcome::Failed,
        operation_type: OperationType::ScheduledCheck,
        started_at: now,
        finished_at: now,
        keys_checked: 0,
        inconsistencies_found: 0,
        items_fixed: 0,
        error: Some("reconcile core has been dropped".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconcileCore, ServiceOptions};
    use crate::db::ledger::SqliteLedger;
    use crate::gateways::memory::MemoryCache;
    use crate::gateways::CacheGateway;
    use crate::models::{
        Dimension, HistoryFilters, OperationType, PageRequest, RebuildRequest, RunOutcome,
    };
    use crate::rebuilder::REBUILD_CONFIRMATION;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn core_with_usage() -> (tempfile::TempDir, Arc<MemoryCache>, Arc<ReconcileCore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(MemoryCache::new());
        let core = ReconcileCore::new(
            dir.path().to_path_buf(),
            cache.clone(),
            ServiceOptions::default(),
        )
        .expect("core");
        let db = core.database();
        db.upsert_api_key("k1", "primary", true).expect("key");
        db.record_usage("k1", 10.0, Utc::now() - Duration::days(400)).expect("usage");
        (dir, cache, core)
    }

    #[tokio::test]
    async fn manual_check_writes_a_history_record() {
        let (_dir, cache, core) = core_with_usage();
        cache.set("k1", Dimension::Total, 9.5).await.expect("set");

        let result = core.check_all(None, "alice").await.expect("check");
        // one drifted total plus four windows that were never cached
        assert_eq!(result.inconsistent_count, 5);
        assert_eq!(result.cache_miss_count, 4);

        let history = core
            .list_history(HistoryFilters::default(), PageRequest::default())
            .expect("history");
        assert_eq!(history.total, 1);
        assert_eq!(history.items[0].operation_type, OperationType::ManualCheck);
        assert_eq!(history.items[0].total_difference, "0.500000");
    }

    #[tokio::test]
    async fn clean_check_records_positive_zero_difference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = ReconcileCore::new(
            dir.path().to_path_buf(),
            Arc::new(MemoryCache::new()),
            ServiceOptions::default(),
        )
        .expect("core");

        let result = core.check_all(None, "alice").await.expect("check");
        assert_eq!(result.inconsistent_count, 0);
        let history = core
            .list_history(HistoryFilters::default(), PageRequest::default())
            .expect("history");
        assert_eq!(history.items[0].total_difference, "0.000000");
    }

    #[tokio::test]
    async fn pinned_clock_makes_repeated_checks_identical() {
        let (_dir, cache, core) = core_with_usage();
        let now = Utc::now();
        let pinned = ReconcileCore::with_gateways(
            core.database().clone(),
            cache.clone(),
            Arc::new(SqliteLedger::pinned_at(core.database().clone(), now)),
            ServiceOptions {
                pinned_now: Some(now),
                ..ServiceOptions::default()
            },
        )
        .expect("core");
        cache.set("k1", Dimension::Total, 9.0).await.expect("set");

        let first = pinned.check_all(None, "alice").await.expect("first");
        let second = pinned.check_all(None, "alice").await.expect("second");
        assert_eq!(first.timestamp, now);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_fix_all_writes_nothing() {
        let (_dir, _cache, core) = core_with_usage();
        let outcome = core.fix_all(&[], "alice").await.expect("fix all");
        assert_eq!(outcome.fixed, 0);
        assert!(outcome.nothing_to_fix());
        let history = core
            .list_history(HistoryFilters::default(), PageRequest::default())
            .expect("history");
        assert_eq!(history.total, 0);
    }

    #[tokio::test]
    async fn auto_fix_run_repairs_and_records_auto_fix() {
        let (_dir, cache, core) = core_with_usage();
        cache.set("k1", Dimension::Total, 2.0).await.expect("set");
        core.update_config(serde_json::json!({ "autoFix": true })).expect("config");

        let summary = core.trigger_now("alice").await.expect("run");
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.operation_type, OperationType::AutoFix);
        assert_eq!(summary.items_fixed, 5);
        assert_eq!(cache.get("k1", Dimension::Total).await.expect("get"), Some(10.0));
        assert_eq!(cache.get("k1", Dimension::Daily).await.expect("get"), Some(0.0));

        let status = core.get_status().expect("status");
        assert_eq!(status.last_run, Some(summary.finished_at));
        assert_eq!(
            status.last_run_result.map(|result| result.operation_type),
            Some(OperationType::AutoFix)
        );
    }

    #[tokio::test]
    async fn failed_scheduled_run_is_recorded_not_raised() {
        let (_dir, cache, core) = core_with_usage();
        cache.set_available(false);

        let summary = core.trigger_now("scheduler").await.expect("run completes");
        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert!(summary.error.is_some());

        let history = core
            .list_history(HistoryFilters::default(), PageRequest::default())
            .expect("history");
        assert_eq!(history.items[0].operation_type, OperationType::ScheduledCheck);
        assert_eq!(history.items[0].keys_checked, 0);
    }

    #[tokio::test]
    async fn rebuild_requires_confirmation_and_is_audited() {
        let (_dir, cache, core) = core_with_usage();
        cache.set("k1", Dimension::Daily, 1.0).await.expect("set");

        let error = core
            .global_rebuild(
                RebuildRequest {
                    confirmation: "please".to_string(),
                },
                "alice",
            )
            .await
            .expect_err("gate");
        assert_eq!(error.kind(), "validation");

        let report = core
            .global_rebuild(
                RebuildRequest {
                    confirmation: REBUILD_CONFIRMATION.to_string(),
                },
                "alice",
            )
            .await
            .expect("rebuild");
        assert_eq!(report.deleted, 1);
        let history = core
            .list_history(
                HistoryFilters {
                    operation_type: Some(OperationType::GlobalRebuild),
                    ..HistoryFilters::default()
                },
                PageRequest::default(),
            )
            .expect("history");
        assert_eq!(history.total, 1);
    }

    #[tokio::test]
    async fn schedule_survives_restart_through_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Arc::new(MemoryCache::new());
        let first = ReconcileCore::new(
            dir.path().to_path_buf(),
            cache.clone(),
            ServiceOptions::default(),
        )
        .expect("core");
        let summary = first.trigger_now("alice").await.expect("run");
        drop(first);

        let second = ReconcileCore::new(dir.path().to_path_buf(), cache, ServiceOptions::default())
            .expect("core");
        let status = second.get_status().expect("status");
        let restored = status.last_run.expect("last run restored");
        assert!((restored - summary.finished_at).num_milliseconds().abs() < 1);
    }
}
