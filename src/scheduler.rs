use crate::errors::{AppError, AppResult};
use crate::models::{RunSummary, RunTrigger, TaskConfig, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Duration;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

type ExecutorFuture = Pin<Box<dyn Future<Output = RunSummary> + Send>>;
pub type Executor = Arc<dyn Fn(RunTrigger, String) -> ExecutorFuture + Send + Sync>;
pub type ConfigSource = Arc<dyn Fn() -> AppResult<TaskConfig> + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct SchedulerState {
    running: bool,
    last_run: Option<DateTime<Utc>>,
    last_result: Option<RunSummary>,
}

/// Clears the running flag even if the executor future is dropped or panics.
struct RunningGuard {
    state: Arc<Mutex<SchedulerState>>,
    summary: Option<RunSummary>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.running = false;
        if let Some(summary) = self.summary.take() {
            state.last_run = Some(summary.finished_at);
            state.last_result = Some(summary);
        }
    }
}

/// Process-wide Idle/Running state machine driving unattended reconciliation runs.
#[derive(Clone)]
pub struct ReconcileScheduler {
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    config_source: Arc<RwLock<Option<ConfigSource>>>,
    started_at: DateTime<Utc>,
    tick: Duration,
}

impl ReconcileScheduler {
    pub fn new(tick: Duration, last_run: Option<DateTime<Utc>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                last_run,
                ..SchedulerState::default()
            })),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            config_source: Arc::new(RwLock::new(None)),
            started_at: Utc::now(),
            tick,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        if let Ok(mut writer) = self.executor.write() {
            *writer = Some(executor);
        }
    }

    pub fn set_config_source(&self, source: ConfigSource) {
        if let Ok(mut writer) = self.config_source.write() {
            *writer = Some(source);
        }
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
    }

    /// Asks the loop to re-evaluate now instead of waiting for the next tick.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn run_loop(self) {
        tracing::info!(tick_secs = self.tick.as_secs(), "reconcile scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = self.notify.notified() => {}
            }
            if let Err(error) = self.evaluate(Utc::now()).await {
                tracing::warn!(error = %error, "scheduler evaluation failed");
            }
        }
    }

    /// Runs a check if the interval has elapsed. Returns the summary when a run happened.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> AppResult<Option<RunSummary>> {
        let config = self.load_config()?;
        let last_run = self.snapshot()?.last_run;
        if !is_due(&config, last_run, self.started_at, now) {
            return Ok(None);
        }

        match self.try_run(RunTrigger::Interval, "scheduler".to_string()).await {
            Ok(summary) => Ok(Some(summary)),
            Err(AppError::SchedulerBusy(_)) => {
                tracing::debug!("interval elapsed while a run is in progress; skipping");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// Manual trigger; runs regardless of `enabled` and is rejected while another run is active.
    pub async fn trigger_now(&self, operator: &str) -> AppResult<RunSummary> {
        self.try_run(RunTrigger::Manual, operator.to_string()).await
    }

    pub fn is_running(&self) -> bool {
        self.snapshot().map(|state| state.running).unwrap_or(false)
    }

    pub fn status(&self, config: &TaskConfig) -> AppResult<TaskStatus> {
        let state = self.snapshot()?;
        let next_run = config
            .enabled
            .then(|| next_run_at(state.last_run.unwrap_or(self.started_at), config.interval_hours));
        Ok(TaskStatus {
            enabled: config.enabled,
            is_running: state.running,
            last_run: state.last_run,
            next_run,
            interval_hours: config.interval_hours,
            last_run_result: state.last_result,
        })
    }

    async fn try_run(&self, trigger: RunTrigger, operator: String) -> AppResult<RunSummary> {
        let executor = self
            .executor
            .read()
            .map_err(|_| AppError::Internal("scheduler executor lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| AppError::Internal("scheduler executor is not configured".to_string()))?;

        let mut guard = self.begin()?;
        tracing::info!(trigger = ?trigger, operator = %operator, "reconcile run started");
        let summary = executor(trigger, operator).await;
        tracing::info!(
            trigger = ?trigger,
            outcome = ?summary.outcome,
            inconsistencies = summary.inconsistencies_found,
            fixed = summary.items_fixed,
            "reconcile run finished"
        );
        guard.summary = Some(summary.clone());
        drop(guard);
        Ok(summary)
    }

    fn begin(&self) -> AppResult<RunningGuard> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Internal("scheduler state mutex poisoned".to_string()))?;
        if state.running {
            return Err(AppError::SchedulerBusy(
                "A reconciliation run is already in progress".to_string(),
            ));
        }
        state.running = true;
        Ok(RunningGuard {
            state: self.state.clone(),
            summary: None,
        })
    }

    fn snapshot(&self) -> AppResult<SchedulerState> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| AppError::Internal("scheduler state mutex poisoned".to_string()))
    }

    fn load_config(&self) -> AppResult<TaskConfig> {
        let source = self
            .config_source
            .read()
            .map_err(|_| AppError::Internal("scheduler config lock poisoned".to_string()))?
            .clone();
        match source {
            Some(source) => source(),
            None => Ok(TaskConfig::default()),
        }
    }
}

pub fn next_run_at(anchor: DateTime<Utc>, interval_hours: u32) -> DateTime<Utc> {
    anchor + ChronoDuration::hours(i64::from(interval_hours))
}

/// Interval runs only fire when enabled; without a previous run the process start is the anchor.
pub fn is_due(
    config: &TaskConfig,
    last_run: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    config.enabled && now >= next_run_at(last_run.unwrap_or(started_at), config.interval_hours)
}

#[cfg(test)]
mod tests {
    use super::{is_due, next_run_at, ReconcileScheduler};
    use crate::models::{OperationType, RunOutcome, RunSummary, RunTrigger, TaskConfig};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn summary(trigger: RunTrigger) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            trigger,
            outcome: RunOutcome::Completed,
            operation_type: OperationType::ScheduledCheck,
            started_at: now,
            finished_at: now,
            keys_checked: 1,
            inconsistencies_found: 0,
            items_fixed: 0,
            error: None,
        }
    }

    #[test]
    fn due_only_when_enabled_and_interval_elapsed() {
        let start = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).single().expect("time");
        let mut config = TaskConfig {
            interval_hours: 3,
            ..TaskConfig::default()
        };
        let later = start + Duration::hours(4);
        assert!(!is_due(&config, None, start, later));

        config.enabled = true;
        assert!(is_due(&config, None, start, later));
        assert!(!is_due(&config, Some(start + Duration::hours(2)), start, later));
        assert_eq!(next_run_at(start, 3), start + Duration::hours(3));
    }

    #[tokio::test]
    async fn manual_trigger_while_running_is_busy_and_state_is_preserved() {
        let scheduler = ReconcileScheduler::new(super::DEFAULT_TICK, None);
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        scheduler.set_executor(Arc::new({
            let entered = entered.clone();
            let release = release.clone();
            move |trigger: RunTrigger, _operator: String| {
                let entered = entered.clone();
                let release = release.clone();
                Box::pin(async move {
                    entered.notify_one();
                    release.notified().await;
                    summary(trigger)
                })
            }
        }));

        let config = TaskConfig {
            enabled: true,
            ..TaskConfig::default()
        };
        let before = scheduler.status(&config).expect("status");

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.trigger_now("alice").await }
        });
        entered.notified().await;
        assert!(scheduler.is_running());

        let error = scheduler.trigger_now("bob").await.expect_err("busy");
        assert_eq!(error.kind(), "scheduler_busy");
        let during = scheduler.status(&config).expect("status");
        assert_eq!(during.last_run, before.last_run);
        assert_eq!(during.next_run, before.next_run);

        release.notify_one();
        let completed = first.await.expect("join").expect("first run");
        let after = scheduler.status(&config).expect("status");
        assert!(!after.is_running);
        assert_eq!(after.last_run, Some(completed.finished_at));
        assert_eq!(after.next_run, Some(completed.finished_at + Duration::hours(6)));
    }

    #[tokio::test]
    async fn evaluate_respects_enabled_flag() {
        let started = Utc::now();
        let scheduler =
            ReconcileScheduler::new(super::DEFAULT_TICK, Some(started - Duration::hours(30)));
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.set_executor(Arc::new({
            let runs = runs.clone();
            move |trigger: RunTrigger, _operator: String| {
                runs.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { summary(trigger) })
            }
        }));

        let enabled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        scheduler.set_config_source(Arc::new({
            let enabled = enabled.clone();
            move || {
                Ok(TaskConfig {
                    enabled: enabled.load(Ordering::SeqCst),
                    interval_hours: 24,
                    ..TaskConfig::default()
                })
            }
        }));

        assert!(scheduler.evaluate(Utc::now()).await.expect("evaluate").is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        enabled.store(true, Ordering::SeqCst);
        let ran = scheduler.evaluate(Utc::now()).await.expect("evaluate");
        assert_eq!(ran.map(|summary| summary.trigger), Some(RunTrigger::Interval));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // last_run is now fresh, so the next evaluation is not due
        assert!(scheduler.evaluate(Utc::now()).await.expect("evaluate").is_none());
    }

    #[tokio::test]
    async fn disabled_scheduler_still_accepts_manual_trigger() {
        let scheduler = ReconcileScheduler::new(super::DEFAULT_TICK, None);
        scheduler.set_executor(Arc::new(|trigger: RunTrigger, _operator: String| {
            Box::pin(async move { summary(trigger) })
        }));
        let result = scheduler.trigger_now("alice").await.expect("manual run");
        assert_eq!(result.trigger, RunTrigger::Manual);
        let status = scheduler.status(&TaskConfig::default()).expect("status");
        assert!(status.last_run.is_some());
        assert!(status.next_run.is_none());
    }
}
