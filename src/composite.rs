use crate::formula::graph::DependencyGraph;
use crate::models::{MetricDataType, MetricValue};
use crate::transform::parse_number;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// (date, clinic, provider). `None` is a scope of its own, not a wildcard.
pub type Scope = (NaiveDate, Option<String>, Option<String>);

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeOutcome {
    pub definition_id: String,
    pub scope: Scope,
    pub value: Option<f64>,
}

/// Metric values folded to one number per (metric, scope). Several values at
/// one scope are summed, except percentages which are averaged.
#[derive(Debug, Clone, Default)]
pub struct ScopedInputs {
    by_metric: HashMap<String, BTreeMap<Scope, f64>>,
    unreadable: usize,
}

impl ScopedInputs {
    pub fn collect(values: &[MetricValue], data_types: &HashMap<String, MetricDataType>) -> Self {
        let mut partial: HashMap<String, BTreeMap<Scope, (f64, usize)>> = HashMap::new();
        let mut unreadable = 0;

        for value in values {
            let Some(raw) = value.value.as_deref() else {
                continue;
            };
            let Some(number) = parse_number(raw, '.') else {
                unreadable += 1;
                continue;
            };
            let scope = (value.date, value.clinic_id.clone(), value.provider_id.clone());
            let entry = partial
                .entry(value.metric_definition_id.clone())
                .or_default()
                .entry(scope)
                .or_insert((0.0, 0));
            entry.0 += number;
            entry.1 += 1;
        }

        let by_metric = partial
            .into_iter()
            .map(|(metric_id, scopes)| {
                let average = matches!(data_types.get(&metric_id), Some(MetricDataType::Percentage));
                let folded = scopes
                    .into_iter()
                    .map(|(scope, (sum, count))| {
                        let value = if average { sum / count as f64 } else { sum };
                        (scope, value)
                    })
                    .collect();
                (metric_id, folded)
            })
            .collect();

        Self { by_metric, unreadable }
    }

    pub fn get(&self, metric_id: &str, scope: &Scope) -> Option<f64> {
        self.by_metric.get(metric_id).and_then(|scopes| scopes.get(scope)).copied()
    }

    /// Stored values that were not numbers.
    pub fn unreadable(&self) -> usize {
        self.unreadable
    }

    fn scopes_of(&self, metric_ids: &[String]) -> BTreeSet<Scope> {
        metric_ids
            .iter()
            .filter_map(|id| self.by_metric.get(id))
            .flat_map(|scopes| scopes.keys().cloned())
            .collect()
    }
}

/// Evaluates `composites` (already in dependency order) at every scope where
/// at least one input has a value. Each result replaces the composite's
/// previous inputs so later composites read the fresh value.
pub fn evaluate_in_order(
    graph: &DependencyGraph,
    composites: &[String],
    inputs: &mut ScopedInputs,
) -> Vec<CompositeOutcome> {
    let mut outcomes = Vec::new();

    for definition_id in composites {
        let Some(node) = graph.node(definition_id) else {
            continue;
        };
        let scopes = inputs.scopes_of(&node.dependencies);
        let mut computed = BTreeMap::new();

        for scope in scopes {
            let value = node
                .formula
                .evaluate(|index| inputs.get(&node.dependencies[index], &scope));
            if let Some(value) = value {
                computed.insert(scope.clone(), value);
            }
            outcomes.push(CompositeOutcome {
                definition_id: definition_id.clone(),
                scope,
                value,
            });
        }

        inputs.by_metric.insert(definition_id.clone(), computed);
    }

    outcomes
}
