//! Unified calculation graph.
//!
//! One graph spans every line item of a template, whatever statement it is
//! reported on. Each node keeps its references in disjoint sets:
//!
//! * `same_period`: codes defined in the template. These are the only edges
//!   and the only thing cycle detection looks at.
//! * `external`: same-period codes the template does not define, resolved
//!   through the provider chain.
//! * `prior_period`: time-shifted references, resolved from closing snapshots
//!   of earlier periods.
//!
//! `CASH = CASH[t-1] + CF_NET` is therefore not a cycle.

use crate::error::{EngineError, Result};
use crate::formula::{Formula, Resolver, VariableRef};
use crate::providers::{lookup, Context, ValueProvider};
use crate::schema::{RuleKind, Severity, StatementTemplate, ValidationRule};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

pub type ValueMap = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub code: String,
    formula: Option<Formula>,
    pub same_period: Vec<String>,
    pub external: Vec<String>,
    pub prior_period: Vec<VariableRef>,
}

impl GraphNode {
    pub fn formula(&self) -> Option<&Formula> {
        self.formula.as_ref()
    }
}

/// Closing snapshots of earlier periods, oldest first.
///
/// The first entry is the run's seed: the closing state of the period before
/// the first one computed. A seed may also carry keys such as `CASH[t-2]` for
/// references that reach further back than the seed itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotHistory {
    snapshots: Vec<ValueMap>,
}

impl SnapshotHistory {
    pub fn new(seed: ValueMap) -> Self {
        Self {
            snapshots: vec![seed],
        }
    }

    pub fn push(&mut self, snapshot: ValueMap) {
        self.snapshots.push(snapshot);
    }

    pub fn latest(&self) -> Option<&ValueMap> {
        self.snapshots.last()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Value of `name` as closed `lag` periods before the current one.
    pub fn value(&self, name: &str, lag: u32) -> Option<f64> {
        let lag = lag as usize;
        if lag == 0 || self.snapshots.is_empty() {
            return None;
        }

        if lag <= self.snapshots.len() {
            return self.snapshots[self.snapshots.len() - lag].get(name).copied();
        }

        let beyond_seed = lag - self.snapshots.len() + 1;
        let key = VariableRef::shifted(name, beyond_seed as u32).key();
        self.snapshots[0].get(&key).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub value: Option<f64>,
    pub message: String,
}

impl RuleViolation {
    pub fn into_error(self) -> EngineError {
        EngineError::ValidationFailed {
            rule_id: self.rule_id,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalculationGraph {
    template: StatementTemplate,
    nodes: Vec<GraphNode>,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
    rules: Vec<(ValidationRule, Formula)>,
}

impl CalculationGraph {
    /// Parses every formula once and schedules the template.
    ///
    /// Fails with `DependencyCycle` naming the cycle's codes when line items
    /// depend on each other within one period.
    pub fn build(template: &StatementTemplate) -> Result<Self> {
        template.validate()?;

        let index: BTreeMap<String, usize> = template
            .line_items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.code.clone(), i))
            .collect();

        let mut nodes = Vec::with_capacity(template.line_items.len());
        for item in &template.line_items {
            let formula = match &item.formula {
                Some(text) => Some(Formula::parse(text).map_err(|e| EngineError::LineItemFailed {
                    code: item.code.clone(),
                    source: Box::new(e),
                })?),
                None => None,
            };

            let mut node = GraphNode {
                code: item.code.clone(),
                formula: None,
                same_period: Vec::new(),
                external: Vec::new(),
                prior_period: Vec::new(),
            };

            if let Some(parsed) = &formula {
                for var in parsed.references() {
                    if var.is_time_shifted() {
                        node.prior_period.push(var.clone());
                    } else if index.contains_key(&var.name) {
                        node.same_period.push(var.name.clone());
                    } else {
                        node.external.push(var.name.clone());
                    }
                }
            }

            node.formula = formula;
            nodes.push(node);
        }

        let order = schedule(&nodes, &index)?;

        let mut rules = Vec::with_capacity(template.validation_rules.len());
        for rule in &template.validation_rules {
            rules.push((rule.clone(), Formula::parse(&rule.formula)?));
        }

        let graph = Self {
            template: template.clone(),
            nodes,
            index,
            order,
            rules,
        };

        debug!(
            "Scheduled template '{}': {}",
            graph.template.code,
            graph.order().join(", ")
        );
        Ok(graph)
    }

    pub fn template(&self) -> &StatementTemplate {
        &self.template
    }

    pub fn template_code(&self) -> &str {
        &self.template.code
    }

    pub fn defines(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    pub fn node(&self, code: &str) -> Option<&GraphNode> {
        self.index.get(code).map(|&i| &self.nodes[i])
    }

    /// Evaluation order of line-item codes.
    pub fn order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.nodes[i].code.as_str())
            .collect()
    }

    /// Time-shifted references to template codes, which must come from prior
    /// snapshots (or the seed).
    pub fn required_prior_keys(&self) -> Vec<VariableRef> {
        let mut seen = BTreeSet::new();
        let mut keys = Vec::new();
        for node in &self.nodes {
            for var in &node.prior_period {
                if self.defines(&var.name) && seen.insert(var.clone()) {
                    keys.push(var.clone());
                }
            }
        }
        keys
    }

    /// Template codes referenced with a time shift anywhere in the template.
    pub fn time_shifted_codes(&self) -> BTreeSet<String> {
        self.required_prior_keys()
            .into_iter()
            .map(|var| var.name)
            .collect()
    }

    pub fn max_lag(&self) -> u32 {
        self.nodes
            .iter()
            .flat_map(|node| node.prior_period.iter().map(|var| var.lag))
            .max()
            .unwrap_or(0)
    }

    fn check_prior_state(&self, history: &SnapshotHistory, ctx: &Context) -> Result<()> {
        for var in self.required_prior_keys() {
            if history.value(&var.name, var.lag).is_none() {
                return Err(EngineError::MissingValue {
                    key: var.key(),
                    context: format!("opening state for {}", ctx),
                });
            }
        }
        Ok(())
    }

    /// Computes every line item for one period.
    ///
    /// Either every node succeeds or the whole period fails; no partial map is
    /// returned.
    pub fn evaluate_period(
        &self,
        ctx: &Context,
        history: &SnapshotHistory,
        providers: &[&dyn ValueProvider],
    ) -> Result<ValueMap> {
        self.check_prior_state(history, ctx)?;

        let mut values = ValueMap::new();
        for &i in &self.order {
            let node = &self.nodes[i];
            let item = &self.template.line_items[i];

            let value = self
                .evaluate_node(node, item.provider_key(), ctx, &values, history, providers)
                .map(|base| item.apply_adjustments(base))
                .and_then(|value| {
                    if value.is_finite() {
                        Ok(value)
                    } else {
                        Err(EngineError::NonFiniteResult)
                    }
                })
                .map_err(|e| EngineError::LineItemFailed {
                    code: node.code.clone(),
                    source: Box::new(e),
                })?;

            values.insert(node.code.clone(), value);
        }

        Ok(values)
    }

    fn evaluate_node(
        &self,
        node: &GraphNode,
        provider_key: &str,
        ctx: &Context,
        values: &ValueMap,
        history: &SnapshotHistory,
        providers: &[&dyn ValueProvider],
    ) -> Result<f64> {
        match &node.formula {
            Some(formula) => formula.evaluate(&PeriodResolver {
                graph: self,
                ctx,
                values,
                history,
                providers,
            }),
            None => lookup(providers, provider_key, ctx),
        }
    }

    /// Runs the template's validation rules against a computed period.
    pub fn validate(
        &self,
        ctx: &Context,
        values: &ValueMap,
        history: &SnapshotHistory,
        providers: &[&dyn ValueProvider],
    ) -> Vec<RuleViolation> {
        let resolver = PeriodResolver {
            graph: self,
            ctx,
            values,
            history,
            providers,
        };

        let mut violations = Vec::new();
        for (rule, formula) in &self.rules {
            let label = rule
                .message
                .clone()
                .unwrap_or_else(|| format!("{} violated", rule.formula));

            match formula.evaluate(&resolver) {
                Ok(value) => {
                    let failed = match rule.kind {
                        RuleKind::Equation => value.abs() > rule.tolerance,
                        RuleKind::Boundary => value < -rule.tolerance,
                    };
                    if failed {
                        violations.push(RuleViolation {
                            rule_id: rule.rule_id.clone(),
                            severity: rule.severity,
                            value: Some(value),
                            message: format!("{} (value {:.4})", label, value),
                        });
                    }
                }
                Err(e) => violations.push(RuleViolation {
                    rule_id: rule.rule_id.clone(),
                    severity: rule.severity,
                    value: None,
                    message: format!("{}: could not evaluate: {}", label, e),
                }),
            }
        }
        violations
    }
}

struct PeriodResolver<'a> {
    graph: &'a CalculationGraph,
    ctx: &'a Context,
    values: &'a ValueMap,
    history: &'a SnapshotHistory,
    providers: &'a [&'a dyn ValueProvider],
}

impl Resolver for PeriodResolver<'_> {
    fn resolve(&self, var: &VariableRef) -> Result<f64> {
        if !self.graph.defines(&var.name) {
            return lookup(self.providers, &var.name, &self.ctx.shifted(var.lag)?);
        }

        let found = if var.is_time_shifted() {
            self.history.value(&var.name, var.lag)
        } else {
            self.values.get(&var.name).copied()
        };

        found.ok_or_else(|| EngineError::MissingValue {
            key: var.key(),
            context: self.ctx.to_string(),
        })
    }
}

/// Kahn's algorithm over same-period edges; ties go to the earliest line item.
fn schedule(nodes: &[GraphNode], index: &BTreeMap<String, usize>) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.same_period {
            if let Some(&d) = index.get(dep) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < nodes.len() {
        let blocked: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] > 0).collect();
        return Err(EngineError::DependencyCycle {
            codes: find_cycle(nodes, index, &blocked),
        });
    }

    Ok(order)
}

/// Walks same-period edges among unscheduled nodes until a node repeats.
fn find_cycle(nodes: &[GraphNode], index: &BTreeMap<String, usize>, blocked: &BTreeSet<usize>) -> Vec<String> {
    let Some(&start) = blocked.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == current) {
            let mut codes: Vec<String> = path[pos..].iter().map(|&i| nodes[i].code.clone()).collect();
            codes.push(nodes[current].code.clone());
            return codes;
        }
        path.push(current);

        let next = nodes[current]
            .same_period
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .find(|dep| blocked.contains(dep));

        match next {
            Some(n) => current = n,
            None => return path.iter().map(|&i| nodes[i].code.clone()).collect(),
        }
    }
}
