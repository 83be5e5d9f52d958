use crate::errors::{AppError, AppResult};
use crate::models::{ColumnMapping, TransformationRule};
use crate::transform::{CellOutcome, CompiledRule};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Compiled transformation rules keyed by column mapping id. An entry is
/// recompiled only when the stored rule differs from the cached one.
#[derive(Debug, Default)]
pub struct RuleCache {
    entries: RwLock<HashMap<String, (Option<TransformationRule>, Arc<CompiledRule>)>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, mapping: &ColumnMapping) -> AppResult<Arc<CompiledRule>> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| AppError::Internal("rule cache lock poisoned".to_string()))?;
            if let Some((rule, compiled)) = entries.get(&mapping.id) {
                if *rule == mapping.transformation_rule {
                    return Ok(compiled.clone());
                }
            }
        }

        let compiled = Arc::new(CompiledRule::compile(mapping.transformation_rule.as_ref())?);
        let mut entries = self
            .entries
            .write()
            .map_err(|_| AppError::Internal("rule cache lock poisoned".to_string()))?;
        entries.insert(
            mapping.id.clone(),
            (mapping.transformation_rule.clone(), compiled.clone()),
        );
        Ok(compiled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCell {
    pub mapping_id: String,
    pub metric_definition_id: String,
    pub column_name: String,
    pub raw: String,
    pub outcome: CellOutcome,
}

#[derive(Debug, Clone)]
struct Binding {
    mapping_id: String,
    metric_definition_id: String,
    column_name: String,
    index: usize,
    rule: Arc<CompiledRule>,
}

/// Binds a data source's mappings to one header row, then turns each data
/// row into per-column outcomes. Malformed rules are collected once here and
/// the affected mapping is left out; malformed cells never fail.
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    bindings: Vec<Binding>,
    configuration_errors: Vec<String>,
    unmatched_columns: Vec<String>,
}

impl ColumnResolver {
    pub fn new(header: &[String], mappings: &[ColumnMapping], rules: &RuleCache) -> Self {
        let mut bindings = Vec::new();
        let mut configuration_errors = Vec::new();
        let mut unmatched_columns = Vec::new();

        for mapping in mappings.iter().filter(|mapping| mapping.is_active) {
            let Some(index) = find_column(header, &mapping.column_name) else {
                unmatched_columns.push(mapping.column_name.clone());
                continue;
            };
            match rules.get_or_compile(mapping) {
                Ok(rule) => bindings.push(Binding {
                    mapping_id: mapping.id.clone(),
                    metric_definition_id: mapping.metric_definition_id.clone(),
                    column_name: mapping.column_name.clone(),
                    index,
                    rule,
                }),
                Err(error) => configuration_errors.push(format!(
                    "column '{}': {}",
                    mapping.column_name, error
                )),
            }
        }

        Self {
            bindings,
            configuration_errors,
            unmatched_columns,
        }
    }

    pub fn resolve_row(&self, row: &[String]) -> Vec<ResolvedCell> {
        self.bindings
            .iter()
            .map(|binding| {
                let raw = cell(row, binding.index).to_string();
                let outcome = binding.rule.apply(&raw);
                ResolvedCell {
                    mapping_id: binding.mapping_id.clone(),
                    metric_definition_id: binding.metric_definition_id.clone(),
                    column_name: binding.column_name.clone(),
                    raw,
                    outcome,
                }
            })
            .collect()
    }

    pub fn configuration_errors(&self) -> &[String] {
        &self.configuration_errors
    }

    pub fn unmatched_columns(&self) -> &[String] {
        &self.unmatched_columns
    }
}

/// Case-insensitive, whitespace-trimmed header lookup; first match wins.
pub fn find_column(header: &[String], name: &str) -> Option<usize> {
    let wanted = name.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    header
        .iter()
        .position(|candidate| candidate.trim().to_lowercase() == wanted)
}

/// Rows shorter than the header read as empty cells.
pub fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}
