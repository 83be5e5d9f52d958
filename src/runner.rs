use crate::composite::{evaluate_in_order, Scope, ScopedInputs};
use crate::connector::{Connector, CredentialProvider};
use crate::errors::{AppError, AppResult};
use crate::formula::graph::DependencyGraph;
use crate::formula::FormulaCache;
use crate::goals;
use crate::ingest::{prepare_row, PreparedRow, RowPlan, SourceLayout, SummaryBuilder, REASON_UNKNOWN_PROVIDER};
use crate::mapping::{ColumnResolver, RuleCache};
use crate::models::{
    CalculatedValue, ColumnMapping, ConnectionStatus, DataSource, Goal, GoalProgress, ImportedValue,
    MetricDataType, MetricDefinition, MetricValue, MetricValueQuery, RecomputeScope, RecomputeSummary,
    RecordManualValuePayload, RowIssue, SaveColumnMappingPayload, SaveDataSourcePayload, SaveGoalPayload,
    SaveMetricDefinitionPayload, SourceType, SyncSummary, UpsertOutcome,
};
use crate::policy;
use crate::redaction::Redactor;
use crate::repository::Repository;
use crate::session::SessionContext;
use crate::settings::AppSettings;
use crate::transform::{format_number, CellOutcome};
use chrono::{DateTime, Days, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

const REASON_TIMED_OUT: &str = "sync timed out";

pub struct MetricsRunner {
    repository: Arc<dyn Repository>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    settings: AppSettings,
    redactor: Redactor,
    rules: RuleCache,
    formulas: FormulaCache,
}

impl MetricsRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        settings: AppSettings,
    ) -> Arc<Self> {
        match repository.mark_orphan_syncs_failed() {
            Ok(interrupted) if interrupted > 0 => {
                tracing::warn!(count = interrupted, "marked orphaned syncs as failed on startup");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(error = %error, "could not recover orphaned syncs"),
        }

        Arc::new(Self {
            repository,
            connector,
            credentials,
            settings,
            redactor: Redactor::new(false),
            rules: RuleCache::new(),
            formulas: FormulaCache::new(),
        })
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub async fn sync_data_source(
        &self,
        ctx: &SessionContext,
        data_source_id: &str,
        deadline: Option<Duration>,
    ) -> AppResult<SyncSummary> {
        ctx.ensure_can_write()?;
        let source = self
            .repository
            .get_data_source(data_source_id)?
            .ok_or_else(|| AppError::NotFound(format!("data source {}", data_source_id)))?;
        ctx.ensure_clinic_access(source.clinic_id.as_deref())?;

        let started_at = Utc::now();
        if let Err(error) = self.repository.try_begin_sync(&source.id, started_at) {
            if matches!(error, AppError::Conflict(_)) {
                tracing::info!(data_source_id = %source.id, "sync rejected: already syncing");
            }
            return Err(error);
        }
        tracing::info!(data_source_id = %source.id, sheet = %source.sheet_name, "sync started");

        let deadline = deadline.unwrap_or_else(|| Duration::from_secs(self.settings.sync_deadline_seconds));
        let mut builder = SummaryBuilder::new(&source.id, started_at, self.settings.issue_sample_limit);
        let outcome = self.pull_rows(&source, &mut builder, deadline).await;

        let finished_at = Utc::now();
        let (status, error) = match outcome {
            Ok(()) => (ConnectionStatus::Connected, None),
            Err(error) => {
                let reason = self.redactor.scrub(&failure_reason(&error));
                tracing::warn!(data_source_id = %source.id, reason = %reason, "sync failed");
                (ConnectionStatus::Error, Some(reason))
            }
        };
        let synced_at = (status == ConnectionStatus::Connected).then_some(finished_at);
        self.record_sync_outcome(&source.id, status, synced_at, error.as_deref())?;

        if status == ConnectionStatus::Connected {
            self.recompute_after_sync(&source, &mut builder);
        }

        let summary = builder.finish(status, error, Utc::now());
        tracing::info!(
            data_source_id = %summary.data_source_id,
            status = summary.connection_status.as_str(),
            rows_processed = summary.rows_processed,
            rows_skipped = summary.rows_skipped,
            rows_failed = summary.rows_failed,
            inserted = summary.values_inserted,
            updated = summary.values_updated,
            "sync finished"
        );
        Ok(summary)
    }

    fn record_sync_outcome(
        &self,
        data_source_id: &str,
        status: ConnectionStatus,
        synced_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> AppResult<()> {
        if let Err(first) = self.repository.finish_sync(data_source_id, status, synced_at, error) {
            tracing::error!(data_source_id = %data_source_id, error = %first, "could not record sync outcome, retrying");
            if let Err(second) = self.repository.finish_sync(data_source_id, status, synced_at, error) {
                tracing::error!(
                    data_source_id = %data_source_id,
                    error = %second,
                    "sync outcome lost; source stays syncing until startup recovery"
                );
                return Err(second);
            }
        }
        Ok(())
    }

    async fn pull_rows(&self, source: &DataSource, builder: &mut SummaryBuilder, deadline: Duration) -> AppResult<()> {
        let deadline_at = Instant::now() + deadline;
        let credentials = self.credentials.credentials_for(source)?;
        let fetch = self
            .connector
            .fetch_rows(&source.spreadsheet_id, &source.sheet_name, &credentials);
        let sheet = match timeout(deadline, fetch).await {
            Ok(fetched) => fetched?,
            Err(_) => return Err(AppError::Transport(REASON_TIMED_OUT.to_string())),
        };

        let layout = match SourceLayout::resolve(source, &sheet.header) {
            Ok(layout) => layout,
            Err(error) => {
                builder.configuration_error(failure_reason(&error));
                return Err(error);
            }
        };

        let mappings = self.usable_mappings(source, builder)?;
        let resolver = ColumnResolver::new(&sheet.header, &mappings, &self.rules);
        for message in resolver.configuration_errors() {
            tracing::warn!(data_source_id = %source.id, error = %message, "mapping excluded from sync");
            builder.configuration_error(message.clone());
        }
        builder.unmatched_columns(resolver.unmatched_columns());

        let mut providers: HashMap<String, Option<String>> = HashMap::new();
        for (index, row) in sheet.rows.iter().enumerate() {
            if Instant::now() >= deadline_at {
                return Err(AppError::Transport(REASON_TIMED_OUT.to_string()));
            }
            match prepare_row(&layout, &resolver, &source.sheet_name, index + 1, row) {
                RowPlan::Blank => builder.blank_row(),
                RowPlan::Failed(issue) => builder.failed_row(issue),
                RowPlan::Ready(prepared) => self.write_row(source, prepared, &mut providers, builder),
            }
        }
        Ok(())
    }

    fn usable_mappings(&self, source: &DataSource, builder: &mut SummaryBuilder) -> AppResult<Vec<ColumnMapping>> {
        let definitions: HashMap<String, MetricDefinition> = self
            .repository
            .list_metric_definitions()?
            .into_iter()
            .map(|definition| (definition.id.clone(), definition))
            .collect();

        let mut usable = Vec::new();
        for mapping in self.repository.list_column_mappings(&source.id)? {
            if !mapping.is_active {
                continue;
            }
            match definitions.get(&mapping.metric_definition_id) {
                Some(definition) if !definition.is_composite => usable.push(mapping),
                Some(definition) => builder.configuration_error(format!(
                    "column '{}' maps to composite metric '{}'",
                    mapping.column_name, definition.name
                )),
                None => builder.configuration_error(format!(
                    "column '{}' maps to unknown metric {}",
                    mapping.column_name, mapping.metric_definition_id
                )),
            }
        }
        Ok(usable)
    }

    fn write_row(
        &self,
        source: &DataSource,
        row: PreparedRow,
        providers: &mut HashMap<String, Option<String>>,
        builder: &mut SummaryBuilder,
    ) {
        let provider_id = match row.provider_name.as_deref() {
            None => None,
            Some(name) => match self.lookup_provider(source, name, providers) {
                Ok(Some(provider_id)) => Some(provider_id),
                Ok(None) => {
                    builder.failed_row(RowIssue {
                        row_number: row.row_number,
                        column: source.provider_column.clone(),
                        reason: REASON_UNKNOWN_PROVIDER.to_string(),
                        raw: Some(name.to_string()),
                    });
                    return;
                }
                Err(error) => {
                    builder.row_storage_failed(row.row_number, &error);
                    return;
                }
            },
        };

        if builder.cells(row.row_number, &row.cells) == 0 {
            return;
        }

        let values: Vec<ImportedValue> = row
            .cells
            .iter()
            .filter_map(|resolved| match &resolved.outcome {
                CellOutcome::Mapped(value) => Some(ImportedValue {
                    metric_definition_id: resolved.metric_definition_id.clone(),
                    data_source_id: source.id.clone(),
                    external_id: row.external_id.clone(),
                    date: row.date,
                    value: value.clone(),
                    source_sheet: source.sheet_name.clone(),
                    clinic_id: source.clinic_id.clone(),
                    provider_id: provider_id.clone(),
                }),
                CellOutcome::Unmapped(_) => None,
            })
            .collect();
        let metric_ids: Vec<&str> = values
            .iter()
            .map(|value| value.metric_definition_id.as_str())
            .collect();

        match self.repository.upsert_imported_row(&values) {
            Ok(upserts) => builder.row_written(&metric_ids, row.date, source.clinic_id.as_deref(), &upserts),
            Err(error) => {
                tracing::warn!(data_source_id = %source.id, row = row.row_number, error = %error, "row upsert failed");
                builder.row_storage_failed(row.row_number, &error);
            }
        }
    }

    fn lookup_provider(
        &self,
        source: &DataSource,
        name: &str,
        providers: &mut HashMap<String, Option<String>>,
    ) -> AppResult<Option<String>> {
        let Some(clinic_id) = source.clinic_id.as_deref() else {
            return Ok(None);
        };
        let key = name.trim().to_lowercase();
        if let Some(known) = providers.get(&key) {
            return Ok(known.clone());
        }
        let found = self
            .repository
            .find_provider_by_name(clinic_id, name)?
            .map(|provider| provider.id);
        providers.insert(key, found.clone());
        Ok(found)
    }

    fn recompute_after_sync(&self, source: &DataSource, builder: &mut SummaryBuilder) {
        let changed = builder.changed_metric_ids();
        let dates = builder.changed_dates();
        let (Some(first), Some(last)) = (dates.first().copied(), dates.last().copied()) else {
            return;
        };
        if changed.is_empty() {
            return;
        }
        // Values that moved between clinics need every clinic refreshed.
        let clinics = builder.changed_clinics();
        let clinic_id = match clinics.as_slice() {
            [only] if *only == source.clinic_id => source.clinic_id.clone(),
            _ => None,
        };

        let scope = RecomputeScope {
            clinic_id,
            start_date: first,
            end_date: last,
            changed_metric_ids: changed,
            dates: Some(dates),
        };
        match self.recompute_in_scope(&scope) {
            Ok(summary) => builder.composites_recomputed(summary.composites_evaluated.len()),
            Err(error) => {
                tracing::warn!(data_source_id = %source.id, error = %error, "post-sync recompute failed");
                builder.configuration_error(format!("composite recompute failed: {}", error));
            }
        }
    }

    pub fn recompute_composites(&self, ctx: &SessionContext, scope: RecomputeScope) -> AppResult<RecomputeSummary> {
        ctx.ensure_can_write()?;
        let clinic_id = ctx.effective_clinic(scope.clinic_id.as_deref())?;
        let scope = RecomputeScope { clinic_id, ..scope };
        self.recompute_in_scope(&scope)
    }

    fn recompute_in_scope(&self, scope: &RecomputeScope) -> AppResult<RecomputeSummary> {
        if scope.end_date < scope.start_date {
            return Err(AppError::Configuration(format!(
                "recompute range ends ({}) before it starts ({})",
                scope.end_date, scope.start_date
            )));
        }

        let definitions = self.repository.list_metric_definitions()?;
        let graph = DependencyGraph::build(&definitions, &self.formulas)?;
        for (definition_id, reason) in graph.invalid() {
            tracing::warn!(metric_definition_id = %definition_id, reason = %reason, "composite excluded from recompute");
        }

        let composites = if scope.changed_metric_ids.is_empty() {
            graph.order().to_vec()
        } else {
            graph.dependents_of(&scope.changed_metric_ids)
        };
        if composites.is_empty() {
            return Ok(RecomputeSummary::default());
        }

        let end_exclusive = scope
            .end_date
            .checked_add_days(Days::new(1))
            .ok_or_else(|| AppError::Configuration(format!("date {} is out of range", scope.end_date)))?;
        let only_dates: Option<BTreeSet<NaiveDate>> = scope.dates.as_ref().map(|dates| dates.iter().copied().collect());
        let in_scope = |date: NaiveDate| only_dates.as_ref().map_or(true, |dates| dates.contains(&date));

        let inputs_query = MetricValueQuery {
            metric_definition_ids: graph.inputs_of(&composites).into_iter().collect(),
            start_date: Some(scope.start_date),
            end_date: Some(end_exclusive),
            clinic_id: scope.clinic_id.clone(),
            ..MetricValueQuery::default()
        };
        let values: Vec<MetricValue> = self
            .repository
            .query_metric_values(&inputs_query)?
            .into_iter()
            .filter(|value| in_scope(value.date))
            .collect();
        let data_types: HashMap<String, MetricDataType> = definitions
            .iter()
            .map(|definition| (definition.id.clone(), definition.data_type))
            .collect();

        let mut inputs = ScopedInputs::collect(&values, &data_types);
        if inputs.unreadable() > 0 {
            tracing::warn!(count = inputs.unreadable(), "ignored non-numeric values during recompute");
        }
        let outcomes = evaluate_in_order(&graph, &composites, &mut inputs);

        let mut summary = RecomputeSummary {
            composites_evaluated: composites.clone(),
            ..RecomputeSummary::default()
        };
        let mut current: HashSet<(String, Scope)> = HashSet::new();
        for outcome in outcomes {
            let (date, clinic_id, provider_id) = outcome.scope.clone();
            let calculated = CalculatedValue {
                metric_definition_id: outcome.definition_id.clone(),
                date,
                clinic_id,
                provider_id,
                value: outcome.value.map(format_number),
            };
            if calculated.value.is_none() {
                summary.values_undefined += 1;
            }
            if self.repository.upsert_calculated_value(&calculated)? != UpsertOutcome::Unchanged {
                summary.values_written += 1;
            }
            current.insert((outcome.definition_id, outcome.scope));
        }

        let stale_query = MetricValueQuery {
            metric_definition_ids: composites.clone(),
            start_date: Some(scope.start_date),
            end_date: Some(end_exclusive),
            clinic_id: scope.clinic_id.clone(),
            source_type: Some(SourceType::Calculated),
            ..MetricValueQuery::default()
        };
        for stored in self.repository.query_metric_values(&stale_query)? {
            if !in_scope(stored.date) {
                continue;
            }
            let key = (
                stored.metric_definition_id.clone(),
                (stored.date, stored.clinic_id.clone(), stored.provider_id.clone()),
            );
            if current.contains(&key) {
                continue;
            }
            if self.repository.delete_calculated_value(
                &stored.metric_definition_id,
                stored.date,
                stored.clinic_id.as_deref(),
                stored.provider_id.as_deref(),
            )? {
                summary.values_removed += 1;
            }
        }

        tracing::info!(
            composites = summary.composites_evaluated.len(),
            written = summary.values_written,
            undefined = summary.values_undefined,
            removed = summary.values_removed,
            "composites recomputed"
        );
        Ok(summary)
    }

    pub fn evaluate_goal(&self, ctx: &SessionContext, goal_id: &str) -> AppResult<GoalProgress> {
        let goal = self
            .repository
            .get_goal(goal_id)?
            .ok_or_else(|| AppError::NotFound(format!("goal {}", goal_id)))?;
        ctx.ensure_clinic_access(goal.clinic_id.as_deref())?;
        let definition = self.definition(&goal.metric_definition_id)?;

        let values = self.repository.query_metric_values(&MetricValueQuery {
            metric_definition_ids: vec![goal.metric_definition_id.clone()],
            start_date: Some(goal.start_date),
            end_date: Some(goal.end_date),
            clinic_id: goal.clinic_id.clone(),
            provider_id: goal.provider_id.clone(),
            ..MetricValueQuery::default()
        })?;
        goals::evaluate(&goal, definition.data_type, &values)
    }

    pub fn save_metric_definition(
        &self,
        ctx: &SessionContext,
        mut payload: SaveMetricDefinitionPayload,
    ) -> AppResult<MetricDefinition> {
        ctx.ensure_can_write()?;
        ctx.ensure_clinic_access(None)?;
        if payload.id.is_none() {
            payload.id = Some(Uuid::new_v4().to_string());
        }
        let existing = self.repository.list_metric_definitions()?;
        if let Err(error) = policy::validate_metric_definition(&payload, &existing, &self.formulas) {
            tracing::warn!(name = %payload.name, error = %error, "metric definition rejected");
            return Err(error);
        }
        self.repository.save_metric_definition(payload)
    }

    pub fn save_data_source(&self, ctx: &SessionContext, payload: SaveDataSourcePayload) -> AppResult<DataSource> {
        ctx.ensure_can_write()?;
        ctx.ensure_clinic_access(payload.clinic_id.as_deref())?;
        if let Some(id) = payload.id.as_deref() {
            if let Some(current) = self.repository.get_data_source(id)? {
                ctx.ensure_clinic_access(current.clinic_id.as_deref())?;
            }
        }
        policy::validate_data_source(&payload)?;
        self.repository.save_data_source(payload)
    }

    pub fn save_column_mapping(
        &self,
        ctx: &SessionContext,
        payload: SaveColumnMappingPayload,
    ) -> AppResult<ColumnMapping> {
        ctx.ensure_can_write()?;
        let source = self
            .repository
            .get_data_source(&payload.data_source_id)?
            .ok_or_else(|| AppError::NotFound(format!("data source {}", payload.data_source_id)))?;
        ctx.ensure_clinic_access(source.clinic_id.as_deref())?;
        let definition = self.definition(&payload.metric_definition_id)?;
        policy::validate_column_mapping(&payload, &source, &definition)?;
        self.repository.save_column_mapping(payload)
    }

    pub fn save_goal(&self, ctx: &SessionContext, payload: SaveGoalPayload) -> AppResult<Goal> {
        ctx.ensure_can_write()?;
        ctx.ensure_clinic_access(payload.clinic_id.as_deref())?;
        let definition = self.definition(&payload.metric_definition_id)?;
        policy::validate_goal(&payload, &definition)?;
        self.repository.save_goal(payload)
    }

    pub fn record_manual_value(
        &self,
        ctx: &SessionContext,
        payload: RecordManualValuePayload,
    ) -> AppResult<MetricValue> {
        ctx.ensure_can_write()?;
        ctx.ensure_clinic_access(payload.clinic_id.as_deref())?;
        let definition = self.definition(&payload.metric_definition_id)?;
        policy::validate_manual_value(&payload, &definition)?;
        let stored = self.repository.insert_manual_value(&payload)?;

        let scope = RecomputeScope {
            clinic_id: stored.clinic_id.clone(),
            start_date: stored.date,
            end_date: stored.date,
            changed_metric_ids: vec![stored.metric_definition_id.clone()],
            dates: None,
        };
        if let Err(error) = self.recompute_in_scope(&scope) {
            tracing::warn!(metric_definition_id = %stored.metric_definition_id, error = %error, "recompute after manual entry failed");
        }
        Ok(stored)
    }

    pub fn list_metric_values(&self, ctx: &SessionContext, query: MetricValueQuery) -> AppResult<Vec<MetricValue>> {
        let clinic_id = ctx.effective_clinic(query.clinic_id.as_deref())?;
        self.repository
            .query_metric_values(&MetricValueQuery { clinic_id, ..query })
    }

    fn definition(&self, id: &str) -> AppResult<MetricDefinition> {
        self.repository
            .get_metric_definition(id)?
            .ok_or_else(|| AppError::NotFound(format!("metric definition {}", id)))
    }
}

fn failure_reason(error: &AppError) -> String {
    match error {
        AppError::Configuration(message)
        | AppError::Transport(message)
        | AppError::Io(message)
        | AppError::Internal(message) => message.clone(),
        other => other.to_string(),
    }
}
