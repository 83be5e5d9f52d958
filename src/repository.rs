use crate::errors::AppResult;
use crate::models::{
    CalculatedValue, Clinic, ColumnMapping, ConnectionStatus, DataSource, Goal, ImportedUpsert, ImportedValue, MetricDefinition,
    MetricValue, MetricValueQuery, Provider, RecordManualValuePayload, SaveColumnMappingPayload,
    SaveDataSourcePayload, SaveGoalPayload, SaveMetricDefinitionPayload, UpsertOutcome,
};
use chrono::{DateTime, NaiveDate, Utc};

/// Storage contract for the metrics pipeline. Every cross-entity read goes
/// through one of these calls; implementations must be safe to share across
/// concurrent syncs.
pub trait Repository: Send + Sync {
    fn insert_clinic(&self, name: &str, location: Option<&str>) -> AppResult<Clinic>;
    fn insert_provider(&self, clinic_id: &str, name: &str, provider_type: Option<&str>) -> AppResult<Provider>;
    /// Case-insensitive name lookup inside one clinic.
    fn find_provider_by_name(&self, clinic_id: &str, name: &str) -> AppResult<Option<Provider>>;

    fn save_metric_definition(&self, payload: SaveMetricDefinitionPayload) -> AppResult<MetricDefinition>;
    fn get_metric_definition(&self, id: &str) -> AppResult<Option<MetricDefinition>>;
    fn list_metric_definitions(&self) -> AppResult<Vec<MetricDefinition>>;

    fn save_data_source(&self, payload: SaveDataSourcePayload) -> AppResult<DataSource>;
    fn get_data_source(&self, id: &str) -> AppResult<Option<DataSource>>;
    fn list_data_sources(&self) -> AppResult<Vec<DataSource>>;

    /// Atomically moves a source into `syncing`. Fails with `Conflict` when a
    /// sync already holds it and `NotFound` when the source does not exist.
    fn try_begin_sync(&self, data_source_id: &str, now: DateTime<Utc>) -> AppResult<()>;
    /// Leaves `syncing` for `status`. `synced_at` is recorded only when present.
    fn finish_sync(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        synced_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> AppResult<()>;
    /// Moves every source stuck in `syncing` to `error`. Returns the count.
    fn mark_orphan_syncs_failed(&self) -> AppResult<u64>;

    fn save_column_mapping(&self, payload: SaveColumnMappingPayload) -> AppResult<ColumnMapping>;
    fn list_column_mappings(&self, data_source_id: &str) -> AppResult<Vec<ColumnMapping>>;

    /// Upserts every value of one source row in a single transaction, keyed by
    /// (metric definition, data source, external id). Updated entries carry
    /// the date and scope the value held before.
    fn upsert_imported_row(&self, values: &[ImportedValue]) -> AppResult<Vec<ImportedUpsert>>;
    /// Upserts keyed by (metric definition, date, clinic, provider).
    fn upsert_calculated_value(&self, value: &CalculatedValue) -> AppResult<UpsertOutcome>;
    fn delete_calculated_value(
        &self,
        metric_definition_id: &str,
        date: NaiveDate,
        clinic_id: Option<&str>,
        provider_id: Option<&str>,
    ) -> AppResult<bool>;
    fn insert_manual_value(&self, payload: &RecordManualValuePayload) -> AppResult<MetricValue>;
    fn query_metric_values(&self, query: &MetricValueQuery) -> AppResult<Vec<MetricValue>>;

    fn save_goal(&self, payload: SaveGoalPayload) -> AppResult<Goal>;
    fn get_goal(&self, id: &str) -> AppResult<Option<Goal>>;
}
