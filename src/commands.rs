//! Operator-facing command surface. Every handler resolves the caller's identity, delegates to the
//! core service and converts failures into a serializable error the client can branch on.

use crate::errors::AppError;
use crate::models::{
    CheckItem, CheckResult, CheckScope, Dimension, FixAllOutcome, FixedEntry, HistoryFilters,
    HistoryRecord, HistoryStats, PageRequest, PageResponse, RebuildReport, RebuildRequest,
    RunSummary, TaskConfig, TaskStatus,
};
use crate::service::ReconcileCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_STATS_WINDOW_DAYS: u32 = 7;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ReconcileCore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixItemPayload {
    pub key_id: String,
    pub dimension: String,
}

pub type CommandResult<T> = Result<T, OperatorError>;

pub async fn check_all(
    state: &AppState,
    operator: &str,
    scope: Option<CheckScope>,
) -> CommandResult<CheckResult> {
    let operator = resolve_operator(operator)?;
    state.core.check_all(scope, &operator).await.map_err(to_client_error)
}

pub async fn fix_item(
    state: &AppState,
    operator: &str,
    payload: FixItemPayload,
) -> CommandResult<FixedEntry> {
    let operator = resolve_operator(operator)?;
    let dimension = Dimension::parse(&payload.dimension).ok_or_else(|| {
        to_client_error(AppError::Validation(format!(
            "Unknown dimension '{}'",
            payload.dimension
        )))
    })?;
    state
        .core
        .fix_item(&payload.key_id, dimension, &operator)
        .await
        .map_err(to_client_error)
}

pub async fn fix_all(
    state: &AppState,
    operator: &str,
    items: Vec<CheckItem>,
) -> CommandResult<FixAllOutcome> {
    let operator = resolve_operator(operator)?;
    state.core.fix_all(&items, &operator).await.map_err(to_client_error)
}

pub async fn global_rebuild(
    state: &AppState,
    operator: &str,
    request: RebuildRequest,
) -> CommandResult<RebuildReport> {
    let operator = resolve_operator(operator)?;
    state
        .core
        .global_rebuild(request, &operator)
        .await
        .map_err(to_client_error)
}

pub fn get_task_status(state: &AppState) -> CommandResult<TaskStatus> {
    state.core.get_status().map_err(to_client_error)
}

pub async fn trigger_now(state: &AppState, operator: &str) -> CommandResult<RunSummary> {
    let operator = resolve_operator(operator)?;
    state.core.trigger_now(&operator).await.map_err(to_client_error)
}

pub fn get_task_config(state: &AppState) -> CommandResult<TaskConfig> {
    state.core.get_config().map_err(to_client_error)
}

pub fn update_task_config(
    state: &AppState,
    update: serde_json::Value,
) -> CommandResult<TaskConfig> {
    state.core.update_config(update).map_err(to_client_error)
}

pub fn list_history(
    state: &AppState,
    filters: HistoryFilters,
    page: PageRequest,
) -> CommandResult<PageResponse<HistoryRecord>> {
    state.core.list_history(filters, page).map_err(to_client_error)
}

pub fn history_stats(state: &AppState, window_days: Option<u32>) -> CommandResult<HistoryStats> {
    state
        .core
        .history_stats(window_days.unwrap_or(DEFAULT_STATS_WINDOW_DAYS))
        .map_err(to_client_error)
}

fn resolve_operator(operator: &str) -> CommandResult<String> {
    let operator = operator.trim();
    if operator.is_empty() {
        return Err(to_client_error(AppError::Validation(
            "An authenticated operator is required".to_string(),
        )));
    }
    Ok(operator.to_string())
}

pub fn to_client_error(error: AppError) -> OperatorError {
    if matches!(error, AppError::Internal(_)) {
        tracing::error!(error = %error, "internal failure surfaced to operator");
    }
    OperatorError {
        kind: error.kind().to_string(),
        message: error.message().to_string(),
        retryable: error.is_retryable(),
    }
}

#[cfg(test)]
mod tests {
    use super::{fix_item, history_stats, to_client_error, trigger_now, AppState, FixItemPayload};
    use crate::errors::AppError;
    use crate::gateways::memory::MemoryCache;
    use crate::service::{ReconcileCore, ServiceOptions};
    use std::sync::Arc;

    fn state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = ReconcileCore::new(
            dir.path().to_path_buf(),
            Arc::new(MemoryCache::new()),
            ServiceOptions::default(),
        )
        .expect("core");
        (dir, AppState { core })
    }

    #[test]
    fn client_errors_carry_kind_and_retry_hint() {
        let error = to_client_error(AppError::TransientIo("cache down".to_string()));
        assert_eq!(error.kind, "transient_io");
        assert_eq!(error.message, "cache down");
        assert!(error.retryable);

        let error = to_client_error(AppError::Validation("bad input".to_string()));
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn anonymous_operators_are_rejected() {
        let (_dir, state) = state();
        let error = trigger_now(&state, "  ").await.expect_err("operator required");
        assert_eq!(error.kind, "validation");
    }

    #[tokio::test]
    async fn unknown_dimension_is_a_validation_error() {
        let (_dir, state) = state();
        let error = fix_item(
            &state,
            "alice",
            FixItemPayload {
                key_id: "k1".to_string(),
                dimension: "hourly".to_string(),
            },
        )
        .await
        .expect_err("bad dimension");
        assert_eq!(error.kind, "validation");
    }

    #[test]
    fn stats_default_to_a_week() {
        let (_dir, state) = state();
        let stats = history_stats(&state, None).expect("stats");
        assert_eq!(stats.window_days, 7);
        assert_eq!(stats.total_checks, 0);
    }
}
