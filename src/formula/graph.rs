use super::{normalize_metric_name, Formula, FormulaCache};
use crate::errors::{AppError, AppResult};
use crate::models::MetricDefinition;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CompositeNode {
    pub definition_id: String,
    pub name: String,
    pub formula: Arc<Formula>,
    /// Definition id for each entry of `formula.references()`, same order.
    pub dependencies: Vec<String>,
}

/// Composite definitions ordered so every composite comes after the
/// composites it references.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, CompositeNode>,
    order: Vec<String>,
    invalid: Vec<(String, String)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    /// Builds the graph over every definition. A composite whose formula does
    /// not parse or references an unknown or text metric is left out and
    /// listed in [`DependencyGraph::invalid`]; a reference cycle fails the
    /// whole build with `AppError::Cycle`.
    pub fn build(definitions: &[MetricDefinition], cache: &FormulaCache) -> AppResult<Self> {
        let mut by_name: HashMap<String, &MetricDefinition> = HashMap::new();
        for definition in definitions {
            if by_name
                .insert(normalize_metric_name(&definition.name), definition)
                .is_some()
            {
                return Err(AppError::Configuration(format!(
                    "metric name '{}' is defined more than once",
                    definition.name
                )));
            }
        }

        let mut composites: Vec<&MetricDefinition> =
            definitions.iter().filter(|definition| definition.is_composite).collect();
        composites.sort_by_key(|definition| normalize_metric_name(&definition.name));

        let mut nodes = HashMap::new();
        let mut invalid = Vec::new();
        for definition in composites {
            match Self::resolve_node(definition, &by_name, cache) {
                Ok(node) => {
                    nodes.insert(definition.id.clone(), node);
                }
                Err(error) => invalid.push((definition.id.clone(), error.to_string())),
            }
        }

        let mut graph = Self {
            nodes,
            order: Vec::new(),
            invalid,
        };
        graph.order = graph.topological_order(definitions)?;
        Ok(graph)
    }

    fn resolve_node(
        definition: &MetricDefinition,
        by_name: &HashMap<String, &MetricDefinition>,
        cache: &FormulaCache,
    ) -> AppResult<CompositeNode> {
        let source = definition
            .calculation_formula
            .as_deref()
            .filter(|source| !source.trim().is_empty())
            .ok_or_else(|| {
                AppError::Configuration(format!("composite metric '{}' has no formula", definition.name))
            })?;
        let formula = cache.get_or_parse(&definition.id, source)?;

        let mut dependencies = Vec::with_capacity(formula.references().len());
        for reference in formula.references() {
            let Some(target) = by_name.get(&normalize_metric_name(reference)) else {
                return Err(AppError::Configuration(format!(
                    "metric '{}' references unknown metric '{}'",
                    definition.name, reference
                )));
            };
            if !target.data_type.is_numeric() {
                return Err(AppError::Configuration(format!(
                    "metric '{}' references text metric '{}'",
                    definition.name, target.name
                )));
            }
            dependencies.push(target.id.clone());
        }

        Ok(CompositeNode {
            definition_id: definition.id.clone(),
            name: definition.name.clone(),
            formula,
            dependencies,
        })
    }

    fn topological_order(&self, definitions: &[MetricDefinition]) -> AppResult<Vec<String>> {
        let names: HashMap<&str, &str> = definitions
            .iter()
            .map(|definition| (definition.id.as_str(), definition.name.as_str()))
            .collect();
        let mut roots: Vec<&CompositeNode> = self.nodes.values().collect();
        roots.sort_by_key(|node| normalize_metric_name(&node.name));

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for root in roots {
            if marks.contains_key(root.definition_id.as_str()) {
                continue;
            }
            // Iterative DFS: (node id, index of the next dependency to visit).
            let mut stack: Vec<(&str, usize)> = vec![(root.definition_id.as_str(), 0)];
            marks.insert(root.definition_id.as_str(), Mark::Visiting);

            while let Some((id, next)) = stack.last().copied() {
                let node = &self.nodes[id];
                if next == node.dependencies.len() {
                    stack.pop();
                    marks.insert(id, Mark::Done);
                    order.push(id.to_string());
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let dependency = node.dependencies[next].as_str();
                if !self.nodes.contains_key(dependency) {
                    continue;
                }
                match marks.get(dependency) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = stack
                            .iter()
                            .position(|(member, _)| *member == dependency)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|(member, _)| names.get(member).copied().unwrap_or(*member).to_string())
                            .collect();
                        cycle.push(names.get(dependency).copied().unwrap_or(dependency).to_string());
                        return Err(AppError::Cycle(cycle));
                    }
                    None => {
                        marks.insert(dependency, Mark::Visiting);
                        stack.push((dependency, 0));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Composite ids in evaluation order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, definition_id: &str) -> Option<&CompositeNode> {
        self.nodes.get(definition_id)
    }

    /// `(definition id, reason)` for composites excluded from evaluation.
    pub fn invalid(&self) -> &[(String, String)] {
        &self.invalid
    }

    /// Every composite that transitively depends on one of `changed`, in
    /// evaluation order. Changed composites themselves are included.
    pub fn dependents_of(&self, changed: &[String]) -> Vec<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in self.nodes.values() {
            for dependency in &node.dependencies {
                reverse
                    .entry(dependency.as_str())
                    .or_default()
                    .push(node.definition_id.as_str());
            }
        }

        let mut reached: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = changed.iter().map(String::as_str).collect();
        while let Some(id) = queue.pop_front() {
            if self.nodes.contains_key(id) {
                reached.insert(id);
            }
            for &dependent in reverse.get(id).into_iter().flatten() {
                if reached.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        self.order
            .iter()
            .filter(|id| reached.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Every metric id a composite in `composites` reads, composite or not.
    pub fn inputs_of(&self, composites: &[String]) -> BTreeSet<String> {
        composites
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|node| node.dependencies.iter().cloned())
            .collect()
    }
}
