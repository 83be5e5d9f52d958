//! Definition-time checks. Everything here runs before a write reaches the
//! repository so that stored configuration always satisfies the model
//! invariants.

use crate::errors::{AppError, AppResult};
use crate::formula::graph::DependencyGraph;
use crate::formula::FormulaCache;
use crate::goals::{aggregation_for, validate_target, validate_window};
use crate::models::{
    DataSource, MetricDefinition, RecordManualValuePayload, SaveColumnMappingPayload, SaveDataSourcePayload,
    SaveGoalPayload, SaveMetricDefinitionPayload,
};
use crate::transform::{parse_number, CompiledRule};
use chrono::Utc;
use std::collections::HashSet;

/// Validates a definition against the full set it will join. `payload.id`
/// must already be assigned. Rejects cycles, unknown or text references,
/// and changes that would break a composite that is valid today.
pub fn validate_metric_definition(
    payload: &SaveMetricDefinitionPayload,
    existing: &[MetricDefinition],
    formulas: &FormulaCache,
) -> AppResult<()> {
    let Some(id) = payload.id.as_deref() else {
        return Err(AppError::Internal("metric definition id must be assigned before validation".to_string()));
    };
    if payload.name.trim().is_empty() {
        return Err(AppError::Configuration("metric name cannot be empty".to_string()));
    }

    let has_formula = payload
        .calculation_formula
        .as_deref()
        .is_some_and(|formula| !formula.trim().is_empty());
    match (payload.is_composite, has_formula) {
        (true, false) => {
            return Err(AppError::Configuration(format!(
                "composite metric '{}' needs a formula",
                payload.name
            )))
        }
        (false, true) => {
            return Err(AppError::Configuration(format!(
                "metric '{}' has a formula but is not composite",
                payload.name
            )))
        }
        _ => {}
    }

    let already_invalid: HashSet<String> = DependencyGraph::build(existing, formulas)
        .map(|graph| graph.invalid().iter().map(|(id, _)| id.clone()).collect())
        .unwrap_or_default();

    let now = Utc::now();
    let candidate = MetricDefinition {
        id: id.to_string(),
        name: payload.name.trim().to_string(),
        description: payload.description.clone(),
        data_type: payload.data_type,
        calculation_formula: payload.calculation_formula.clone(),
        category: payload.category.clone(),
        is_composite: payload.is_composite,
        created_at: now,
        updated_at: now,
    };
    let mut proposed: Vec<MetricDefinition> = existing
        .iter()
        .filter(|definition| definition.id != id)
        .cloned()
        .collect();
    proposed.push(candidate);

    let graph = DependencyGraph::build(&proposed, formulas)?;
    for (invalid_id, reason) in graph.invalid() {
        if invalid_id == id || !already_invalid.contains(invalid_id) {
            return Err(AppError::Configuration(reason.clone()));
        }
    }
    Ok(())
}

pub fn validate_data_source(payload: &SaveDataSourcePayload) -> AppResult<()> {
    for (field, value) in [
        ("name", payload.name.as_str()),
        ("spreadsheetId", payload.spreadsheet_id.as_str()),
        ("sheetName", payload.sheet_name.as_str()),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Configuration(format!("data source {} cannot be empty", field)));
        }
    }
    Ok(())
}

/// Mappings target a base metric of the same source and carry a rule that compiles.
pub fn validate_column_mapping(
    payload: &SaveColumnMappingPayload,
    data_source: &DataSource,
    definition: &MetricDefinition,
) -> AppResult<()> {
    if payload.column_name.trim().is_empty() {
        return Err(AppError::Configuration("mapped column name cannot be empty".to_string()));
    }
    if payload.data_source_id != data_source.id {
        return Err(AppError::Internal("mapping validated against the wrong data source".to_string()));
    }
    if definition.is_composite {
        return Err(AppError::Configuration(format!(
            "column '{}' cannot feed composite metric '{}'",
            payload.column_name.trim(),
            definition.name
        )));
    }
    if payload
        .column_name
        .trim()
        .eq_ignore_ascii_case(data_source.date_column.trim())
    {
        return Err(AppError::Configuration(format!(
            "column '{}' is the date column of this data source",
            payload.column_name.trim()
        )));
    }
    CompiledRule::compile(payload.transformation_rule.as_ref())?;
    Ok(())
}

pub fn validate_goal(payload: &SaveGoalPayload, definition: &MetricDefinition) -> AppResult<()> {
    aggregation_for(definition.data_type).map_err(|_| {
        AppError::Configuration(format!("metric '{}' is text and cannot carry a goal", definition.name))
    })?;
    validate_window(payload.time_period, payload.start_date, payload.end_date)?;
    validate_target(payload.target_value)?;
    Ok(())
}

pub fn validate_manual_value(payload: &RecordManualValuePayload, definition: &MetricDefinition) -> AppResult<()> {
    if definition.is_composite {
        return Err(AppError::Configuration(format!(
            "composite metric '{}' is calculated and cannot be entered manually",
            definition.name
        )));
    }
    if payload.value.trim().is_empty() {
        return Err(AppError::Configuration("manual value cannot be empty".to_string()));
    }
    if definition.data_type.is_numeric() && parse_number(&payload.value, '.').is_none() {
        return Err(AppError::Configuration(format!(
            "'{}' is not a number for metric '{}'",
            payload.value, definition.name
        )));
    }
    Ok(())
}
