use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ALLOWED_INTERVAL_HOURS: [u32; 5] = [1, 3, 6, 12, 24];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Total,
    Daily,
    Weekly,
    Monthly,
    FiveHour,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Self::Total,
        Self::Daily,
        Self::Weekly,
        Self::Monthly,
        Self::FiveHour,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::FiveHour => "five_hour",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "total" => Some(Self::Total),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "five_hour" => Some(Self::FiveHour),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Drift,
    CacheMiss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckItem {
    pub key_id: String,
    pub key_name: String,
    pub dimension: Dimension,
    pub kind: ItemKind,
    pub cached_value: Option<f64>,
    pub ledger_value: f64,
    pub difference: f64,
    /// `None` when the ledger value is zero and there is no relative baseline.
    pub difference_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub timestamp: DateTime<Utc>,
    pub total_keys_checked: u32,
    pub inconsistent_count: u32,
    pub cache_miss_count: u32,
    pub total_difference_usd: f64,
    pub average_difference_rate: f64,
    pub items: Vec<CheckItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckScope {
    pub key_ids: Option<Vec<String>>,
    pub dimensions: Option<Vec<Dimension>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub enabled: bool,
    pub interval_hours: u32,
    pub auto_fix: bool,
    pub threshold_usd: f64,
    pub threshold_rate: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 6,
            auto_fix: false,
            threshold_usd: 0.01,
            threshold_rate: 1.0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Interval,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub trigger: RunTrigger,
    pub outcome: RunOutcome,
    pub operation_type: OperationType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub keys_checked: u32,
    pub inconsistencies_found: u32,
    pub items_fixed: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub enabled: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub interval_hours: u32,
    pub last_run_result: Option<RunSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedEntry {
    pub key_id: String,
    pub dimension: Dimension,
    pub previous_value: Option<f64>,
    pub written_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixFailure {
    pub key_id: String,
    pub dimension: Dimension,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAllOutcome {
    pub attempted: u32,
    pub fixed: u32,
    pub entries: Vec<FixedEntry>,
    pub failures: Vec<FixFailure>,
}

impl FixAllOutcome {
    pub fn nothing_to_fix(&self) -> bool {
        self.attempted == 0
    }

    pub fn failed_entirely(&self) -> bool {
        self.attempted > 0 && self.fixed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub deleted: u64,
    pub remaining: u64,
}

impl RebuildReport {
    pub fn is_partial(&self) -> bool {
        self.remaining > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ManualCheck,
    ScheduledCheck,
    ManualFix,
    AutoFix,
    GlobalRebuild,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManualCheck => "manual_check",
            Self::ScheduledCheck => "scheduled_check",
            Self::ManualFix => "manual_fix",
            Self::AutoFix => "auto_fix",
            Self::GlobalRebuild => "global_rebuild",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual_check" => Some(Self::ManualCheck),
            "scheduled_check" => Some(Self::ScheduledCheck),
            "manual_fix" => Some(Self::ManualFix),
            "auto_fix" => Some(Self::AutoFix),
            "global_rebuild" => Some(Self::GlobalRebuild),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum ScheduledCheckDetails {
    Completed(CheckResult),
    Failed(RunFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoFixDetails {
    pub check: CheckResult,
    pub fix: FixAllOutcome,
}

/// Operation-specific audit payload; the variant determines the record's operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operationType", content = "payload", rename_all = "snake_case")]
pub enum HistoryDetails {
    ManualCheck(CheckResult),
    ScheduledCheck(ScheduledCheckDetails),
    ManualFix(FixAllOutcome),
    AutoFix(AutoFixDetails),
    GlobalRebuild(RebuildReport),
}

impl HistoryDetails {
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::ManualCheck(_) => OperationType::ManualCheck,
            Self::ScheduledCheck(_) => OperationType::ScheduledCheck,
            Self::ManualFix(_) => OperationType::ManualFix,
            Self::AutoFix(_) => OperationType::AutoFix,
            Self::GlobalRebuild(_) => OperationType::GlobalRebuild,
        }
    }

    pub fn keys_checked(&self) -> u32 {
        match self {
            Self::ManualCheck(check)
            | Self::ScheduledCheck(ScheduledCheckDetails::Completed(check))
            | Self::AutoFix(AutoFixDetails { check, .. }) => check.total_keys_checked,
            Self::ScheduledCheck(ScheduledCheckDetails::Failed(_))
            | Self::ManualFix(_)
            | Self::GlobalRebuild(_) => 0,
        }
    }

    pub fn inconsistencies_found(&self) -> u32 {
        match self {
            Self::ManualCheck(check)
            | Self::ScheduledCheck(ScheduledCheckDetails::Completed(check))
            | Self::AutoFix(AutoFixDetails { check, .. }) => check.inconsistent_count,
            Self::ManualFix(fix) => fix.attempted,
            Self::ScheduledCheck(ScheduledCheckDetails::Failed(_)) | Self::GlobalRebuild(_) => 0,
        }
    }

    pub fn items_fixed(&self) -> u32 {
        match self {
            Self::ManualFix(fix) | Self::AutoFix(AutoFixDetails { fix, .. }) => fix.fixed,
            _ => 0,
        }
    }

    pub fn total_difference(&self) -> f64 {
        match self {
            Self::ManualCheck(check)
            | Self::ScheduledCheck(ScheduledCheckDetails::Completed(check))
            | Self::AutoFix(AutoFixDetails { check, .. }) => check.total_difference_usd,
            Self::ManualFix(fix) => fix.entries.iter().fold(0.0, |acc, entry| {
                acc + (entry.written_value - entry.previous_value.unwrap_or(0.0)).abs()
            }),
            Self::ScheduledCheck(ScheduledCheckDetails::Failed(_)) | Self::GlobalRebuild(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation_type: OperationType,
    pub operator: String,
    pub keys_checked: u32,
    pub inconsistencies_found: u32,
    pub items_fixed: u32,
    pub total_difference: String,
    pub details: HistoryDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilters {
    pub operation_type: Option<OperationType>,
    pub operator: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub window_days: u32,
    pub total_checks: u64,
    pub total_inconsistencies: u64,
    pub total_fixed: u64,
    pub fix_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildRequest {
    pub confirmation: String,
}
