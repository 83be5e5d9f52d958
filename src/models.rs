use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TRANSFORMATION_RULE_VERSION: u32 = 1;
pub const FORMULA_GRAMMAR_VERSION: u32 = 1;

// ─── Enumerations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricDataType {
    Numeric,
    Currency,
    Percentage,
    Text,
}

impl MetricDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::Currency => "currency",
            Self::Percentage => "percentage",
            Self::Text => "text",
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncFrequency {
    Manual,
    Hourly,
    Daily,
    Weekly,
}

impl SyncFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Idle,
    Syncing,
    Error,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Manual,
    Imported,
    Calculated,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Imported => "imported",
            Self::Calculated => "calculated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimePeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl TimePeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Annual => "annual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Manager,
    Viewer,
}

// ─── Tenancy ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clinic {
    pub id: String,
    pub name: String,
    pub location: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub provider_type: Option<String>,
    pub status: String,
    pub clinic_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Metric definitions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub data_type: MetricDataType,
    pub calculation_formula: Option<String>,
    pub category: Option<String>,
    pub is_composite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetricDefinitionPayload {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub data_type: MetricDataType,
    pub calculation_formula: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub is_composite: bool,
}

// ─── Data sources and mappings ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub clinic_id: Option<String>,
    pub date_column: String,
    pub key_column: Option<String>,
    pub provider_column: Option<String>,
    pub sync_frequency: SyncFrequency,
    pub connection_status: ConnectionStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub app_script_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDataSourcePayload {
    pub id: Option<String>,
    pub name: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub clinic_id: Option<String>,
    pub date_column: Option<String>,
    pub key_column: Option<String>,
    pub provider_column: Option<String>,
    pub sync_frequency: Option<SyncFrequency>,
    pub app_script_id: Option<String>,
}

/// Persisted transformation rule. Serialized with a `kind` tag so the stored
/// JSON stays readable (`{"kind":"scale","factor":100}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransformationRule {
    None,
    #[serde(rename_all = "camelCase")]
    ParseNumber {
        #[serde(default = "default_decimal_separator")]
        decimal_separator: char,
    },
    Scale {
        factor: f64,
    },
    RegexExtract {
        pattern: String,
        #[serde(default)]
        group: usize,
    },
    MapEnum {
        table: BTreeMap<String, String>,
    },
}

fn default_decimal_separator() -> char {
    '.'
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub id: String,
    pub data_source_id: String,
    pub column_name: String,
    pub metric_definition_id: String,
    pub transformation_rule: Option<TransformationRule>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveColumnMappingPayload {
    pub id: Option<String>,
    pub data_source_id: String,
    pub column_name: String,
    pub metric_definition_id: String,
    pub transformation_rule: Option<TransformationRule>,
    pub is_active: Option<bool>,
}

// ─── Metric values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub id: String,
    pub date: NaiveDate,
    /// `None` only for calculated values whose formula was undefined at this scope.
    pub value: Option<String>,
    pub source_type: SourceType,
    pub source_sheet: Option<String>,
    pub external_id: Option<String>,
    pub metric_definition_id: String,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
    pub data_source_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedValue {
    pub metric_definition_id: String,
    pub data_source_id: String,
    pub external_id: String,
    pub date: NaiveDate,
    pub value: String,
    pub source_sheet: String,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalculatedValue {
    pub metric_definition_id: String,
    pub date: NaiveDate,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordManualValuePayload {
    pub metric_definition_id: String,
    pub date: NaiveDate,
    pub value: String,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Date and scope an imported value held before an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousPlacement {
    pub date: NaiveDate,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedUpsert {
    pub outcome: UpsertOutcome,
    /// Set on `Updated` only.
    pub previous: Option<PreviousPlacement>,
}

impl ImportedUpsert {
    pub fn inserted() -> Self {
        Self { outcome: UpsertOutcome::Inserted, previous: None }
    }

    pub fn unchanged() -> Self {
        Self { outcome: UpsertOutcome::Unchanged, previous: None }
    }
}

/// Half-open date range `[start_date, end_date)`; `None` clinic/provider means any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueQuery {
    pub metric_definition_ids: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
    pub source_type: Option<SourceType>,
    pub data_source_id: Option<String>,
}

// ─── Goals ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub time_period: TimePeriod,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub target_value: f64,
    pub metric_definition_id: String,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveGoalPayload {
    pub id: Option<String>,
    pub time_period: TimePeriod,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub target_value: f64,
    pub metric_definition_id: String,
    pub clinic_id: Option<String>,
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    Sum,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Achievement {
    Measured { ratio: f64 },
    InsufficientData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalProgress {
    pub goal_id: String,
    pub metric_definition_id: String,
    pub aggregation: Aggregation,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub target_value: f64,
    pub actual: Option<f64>,
    pub achievement: Achievement,
    pub days_with_data: u32,
    pub days_in_window: u32,
    pub data_points: u32,
    pub unreadable_values: u32,
}

// ─── Sync and recompute summaries ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIssue {
    pub row_number: usize,
    pub column: Option<String>,
    pub reason: String,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub data_source_id: String,
    pub connection_status: ConnectionStatus,
    pub rows_processed: usize,
    pub rows_skipped: usize,
    pub rows_failed: usize,
    pub rows_blank: usize,
    pub values_inserted: usize,
    pub values_updated: usize,
    pub values_unchanged: usize,
    pub cells_unmapped: usize,
    pub skip_reasons: BTreeMap<String, usize>,
    pub issues: Vec<RowIssue>,
    pub configuration_errors: Vec<String>,
    pub unmatched_columns: Vec<String>,
    pub composites_recomputed: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeScope {
    pub clinic_id: Option<String>,
    pub start_date: NaiveDate,
    /// Inclusive.
    pub end_date: NaiveDate,
    /// Base metrics whose values changed; empty means every composite.
    #[serde(default)]
    pub changed_metric_ids: Vec<String>,
    /// Restricts the pass to these dates inside the range.
    #[serde(default)]
    pub dates: Option<Vec<NaiveDate>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub composites_evaluated: Vec<String>,
    pub values_written: usize,
    pub values_undefined: usize,
    pub values_removed: usize,
}
