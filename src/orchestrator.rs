use crate::actions::{ActionEngine, TriggerTracker, TriggerUpdate};
use crate::balancer::verify_accounting_equation;
use crate::engine::{CalculationGraph, SnapshotHistory, ValueMap};
use crate::error::{EngineError, ErrorKind, Result};
use crate::formula::Formula;
use crate::providers::{Context, ValueProvider};
use crate::schema::{
    EngineConfig, PeriodId, ScenarioAction, ScenarioId, Severity, StatementTemplate, Transformation,
};
use crate::storage::TemplateStore;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One reported failure, kept as data so batches of runs can be compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIssue {
    pub period_id: Option<PeriodId>,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunIssue {
    pub fn from_error(period_id: Option<PeriodId>, error: &EngineError) -> Self {
        Self {
            period_id,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodResult {
    pub period_id: PeriodId,
    pub template_code: String,
    /// Empty unless the period succeeded.
    pub values: ValueMap,
    pub active_actions: Vec<String>,
    pub success: bool,
    pub errors: Vec<RunIssue>,
    pub warnings: Vec<String>,
}

impl PeriodResult {
    pub fn value(&self, code: &str) -> Option<f64> {
        self.values.get(code).copied()
    }

    fn failed(period_id: PeriodId, template_code: &str, error: &EngineError) -> Self {
        Self {
            period_id,
            template_code: template_code.to_string(),
            values: ValueMap::new(),
            active_actions: Vec::new(),
            success: false,
            errors: vec![RunIssue::from_error(Some(period_id), error)],
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub entity_id: String,
    pub scenario_id: ScenarioId,
    pub periods: Vec<PeriodResult>,
    pub success: bool,
    pub errors: Vec<RunIssue>,
    pub warnings: Vec<String>,
}

impl RunResult {
    fn new(entity_id: &str, scenario_id: ScenarioId) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            scenario_id,
            periods: Vec::new(),
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn record(&mut self, period: PeriodResult) {
        self.errors.extend(period.errors.iter().cloned());
        self.warnings.extend(period.warnings.iter().cloned());
        self.success &= period.success;
        self.periods.push(period);
    }

    fn fail(&mut self, issue: RunIssue) {
        self.success = false;
        self.errors.push(issue);
    }

    pub fn period(&self, period_id: PeriodId) -> Option<&PeriodResult> {
        self.periods.iter().find(|p| p.period_id == period_id)
    }

    pub fn value(&self, period_id: PeriodId, code: &str) -> Option<f64> {
        self.period(period_id)?.value(code)
    }

    /// `(period, value)` for every successful period that computed `code`.
    pub fn series(&self, code: &str) -> Vec<(PeriodId, f64)> {
        self.periods
            .iter()
            .filter_map(|p| p.value(code).map(|v| (p.period_id, v)))
            .collect()
    }

    /// Values of the last successfully computed period.
    pub fn closing_snapshot(&self) -> Option<&ValueMap> {
        self.periods
            .iter()
            .rev()
            .find(|p| p.success)
            .map(|p| &p.values)
    }
}

/// Checked once per period boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub entity_id: String,
    pub scenario_id: ScenarioId,
    pub base_template_code: String,
    /// Strictly increasing.
    pub period_ids: Vec<PeriodId>,
    /// Closing state of the period before the first one.
    #[serde(default)]
    pub seed: ValueMap,
    #[serde(default)]
    pub actions: Vec<ScenarioAction>,
}

impl RunRequest {
    pub fn new(entity_id: &str, scenario_id: ScenarioId, base_template_code: &str, period_ids: Vec<PeriodId>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            scenario_id,
            base_template_code: base_template_code.to_string(),
            period_ids,
            seed: ValueMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_seed_value(mut self, code: &str, value: f64) -> Self {
        self.seed.insert(code.to_string(), value);
        self
    }

    pub fn with_actions(mut self, actions: Vec<ScenarioAction>) -> Self {
        self.actions = actions;
        self
    }
}

/// Runs a template across periods, threading closing state forward and
/// switching to action variants as triggers fire.
pub struct PeriodRunner {
    store: Arc<dyn TemplateStore>,
    config: EngineConfig,
    providers: Vec<Arc<dyn ValueProvider>>,
    actions: ActionEngine,
    cancellation: CancellationToken,
}

impl PeriodRunner {
    pub fn new(store: Arc<dyn TemplateStore>, config: EngineConfig) -> Self {
        let actions = ActionEngine::new(store.clone(), &config.variant_code_separator);
        Self {
            store,
            config,
            providers: Vec::new(),
            actions,
            cancellation: CancellationToken::new(),
        }
    }

    /// Providers are consulted in registration order.
    pub fn with_provider(mut self, provider: Arc<dyn ValueProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn action_engine(&self) -> &ActionEngine {
        &self.actions
    }

    /// Runs every requested period in order, stopping at the first failure.
    ///
    /// Returns `Err` only when the run cannot start: invalid configuration, an
    /// unknown base template, or a base template with a dependency cycle.
    /// Failures after that are reported in the [`RunResult`].
    pub fn run(&self, request: &RunRequest) -> Result<RunResult> {
        self.config.validate()?;
        validate_periods(&request.period_ids)?;

        let base = self.store.load(&request.base_template_code)?;
        let base_graph = Arc::new(CalculationGraph::build(&base)?);

        info!(
            "Starting run for entity {} scenario {} on '{}' ({} periods, {} actions)",
            request.entity_id,
            request.scenario_id,
            base.code,
            request.period_ids.len(),
            request.actions.len()
        );

        let carried = carried_time_shifted_codes(&base_graph, &request.actions);
        let providers: Vec<&dyn ValueProvider> = self.providers.iter().map(|p| p.as_ref()).collect();
        let mut tracker = TriggerTracker::new(request.scenario_id, request.actions.clone());
        let mut variants: BTreeMap<String, Arc<CalculationGraph>> = BTreeMap::new();
        let mut history = SnapshotHistory::new(request.seed.clone());
        let mut result = RunResult::new(&request.entity_id, request.scenario_id);

        for &period_id in &request.period_ids {
            if self.cancellation.is_cancelled() {
                warn!("Run for scenario {} cancelled before period {}", request.scenario_id, period_id);
                result.fail(RunIssue::from_error(
                    Some(period_id),
                    &EngineError::Cancelled { period_id },
                ));
                break;
            }

            let update = tracker.advance(period_id, result.periods.last());
            let graph = if update.active.is_empty() {
                base_graph.clone()
            } else {
                match self.variant_graph(&base, request.scenario_id, &tracker, &update.active, &mut variants) {
                    Ok(graph) => graph,
                    Err(e) => {
                        result.record(PeriodResult::failed(period_id, &base.code, &e));
                        break;
                    }
                }
            };

            let ctx = Context::new(request.scenario_id, period_id, request.entity_id.as_str());
            let period = self.run_period(&graph, &ctx, &history, &providers, update);

            if !period.success {
                warn!(
                    "Period {} of scenario {} failed; stopping run",
                    period_id, request.scenario_id
                );
                result.record(period);
                break;
            }

            history.push(self.closing_state(&graph, &carried, &period.values));
            result.record(period);
        }

        info!(
            "Finished run for scenario {}: {} periods computed, success = {}",
            request.scenario_id,
            result.periods.iter().filter(|p| p.success).count(),
            result.success
        );
        Ok(result)
    }

    /// Runs independent requests. A failing or unstartable run is reported in
    /// its own result and does not stop the others.
    pub fn run_multiple_scenarios(&self, requests: &[RunRequest]) -> BTreeMap<ScenarioId, RunResult> {
        let mut results = BTreeMap::new();
        for request in requests {
            let result = self.run(request).unwrap_or_else(|e| {
                warn!("Scenario {} could not start: {}", request.scenario_id, e);
                let mut failed = RunResult::new(&request.entity_id, request.scenario_id);
                failed.fail(RunIssue::from_error(None, &e));
                failed
            });
            if results.insert(request.scenario_id, result).is_some() {
                warn!(
                    "Scenario {} requested more than once; keeping the last result",
                    request.scenario_id
                );
            }
        }
        results
    }

    fn variant_graph(
        &self,
        base: &StatementTemplate,
        scenario_id: ScenarioId,
        tracker: &TriggerTracker,
        active: &BTreeSet<String>,
        cache: &mut BTreeMap<String, Arc<CalculationGraph>>,
    ) -> Result<Arc<CalculationGraph>> {
        let code = self.actions.variant_code(&base.code, scenario_id, active);
        if let Some(graph) = cache.get(&code) {
            return Ok(graph.clone());
        }

        let variant = self
            .actions
            .materialize_variant(base, scenario_id, tracker.actions(), active)?;
        let graph = Arc::new(CalculationGraph::build(&variant)?);
        cache.insert(code, graph.clone());
        Ok(graph)
    }

    fn run_period(
        &self,
        graph: &CalculationGraph,
        ctx: &Context,
        history: &SnapshotHistory,
        providers: &[&dyn ValueProvider],
        update: TriggerUpdate,
    ) -> PeriodResult {
        debug!(
            "Period {} using template '{}' with actions {:?}",
            ctx.period_id,
            graph.template_code(),
            update.active
        );

        let mut period = PeriodResult {
            period_id: ctx.period_id,
            template_code: graph.template_code().to_string(),
            values: ValueMap::new(),
            active_actions: update.active.into_iter().collect(),
            success: false,
            errors: Vec::new(),
            warnings: update.warnings,
        };

        let values = match graph.evaluate_period(ctx, history, providers) {
            Ok(values) => values,
            Err(e) => {
                period.errors.push(RunIssue::from_error(Some(ctx.period_id), &e));
                return period;
            }
        };

        for violation in graph.validate(ctx, &values, history, providers) {
            match violation.severity {
                Severity::Warning => {
                    warn!("Period {}: {}: {}", ctx.period_id, violation.rule_id, violation.message);
                    period
                        .warnings
                        .push(format!("{}: {}", violation.rule_id, violation.message));
                }
                Severity::Error => period
                    .errors
                    .push(RunIssue::from_error(Some(ctx.period_id), &violation.into_error())),
            }
        }

        if let Err(e) = verify_accounting_equation(&self.config, ctx.period_id, &values) {
            period.errors.push(RunIssue::from_error(Some(ctx.period_id), &e));
        }

        period.success = period.errors.is_empty();
        if period.success {
            period.values = values;
        }
        period
    }

    /// Opening state for the next period.
    fn closing_state(&self, graph: &CalculationGraph, carried: &BTreeSet<String>, values: &ValueMap) -> ValueMap {
        let mut codes: BTreeSet<String> = graph
            .template()
            .line_items
            .iter()
            .filter(|item| item.is_carry_forward())
            .map(|item| item.code.clone())
            .collect();

        if self.config.carry_forward_all_time_shifted {
            codes.extend(graph.time_shifted_codes());
            codes.extend(carried.iter().cloned());
        }

        codes
            .into_iter()
            .filter_map(|code| values.get(&code).map(|v| (code, *v)))
            .collect()
    }
}

/// Template codes read with a time shift by the base template or by any
/// formula override an action could switch on later in the run.
fn carried_time_shifted_codes(base: &CalculationGraph, actions: &[ScenarioAction]) -> BTreeSet<String> {
    let mut codes = base.time_shifted_codes();
    let overrides = actions
        .iter()
        .flat_map(|action| action.transformations.iter())
        .filter_map(|transformation| match transformation {
            Transformation::FormulaOverride { new_formula, .. } => Formula::parse(new_formula).ok(),
            _ => None,
        });
    for formula in overrides {
        codes.extend(
            formula
                .references()
                .iter()
                .filter(|var| var.is_time_shifted() && base.defines(&var.name))
                .map(|var| var.name.clone()),
        );
    }
    codes
}

fn validate_periods(period_ids: &[PeriodId]) -> Result<()> {
    if period_ids.is_empty() {
        return Err(EngineError::InvalidConfiguration(
            "a run needs at least one period".to_string(),
        ));
    }
    if period_ids.windows(2).any(|pair| pair[1] <= pair[0]) {
        return Err(EngineError::InvalidConfiguration(format!(
            "period ids must be strictly increasing, got {:?}",
            period_ids
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{DriverValueProvider, MapProvider};
    use crate::schema::{LineItemDefinition, StatementCategory};
    use crate::storage::InMemoryTemplateStore;

    fn cash_template() -> StatementTemplate {
        StatementTemplate::new("CASH_ONLY")
            .with_line_item(LineItemDefinition::driver("CF_NET", StatementCategory::CashFlow))
            .with_line_item(LineItemDefinition::computed(
                "CASH",
                "CASH[t-1] + CF_NET",
                StatementCategory::BalanceSheet,
            ))
    }

    fn runner(template: StatementTemplate, provider: Arc<dyn ValueProvider>) -> PeriodRunner {
        let store = Arc::new(InMemoryTemplateStore::new().with_template(template));
        PeriodRunner::new(store, EngineConfig::default()).with_provider(provider)
    }

    #[test]
    fn test_override_time_shifts_are_carried_from_the_start() {
        let template = StatementTemplate::new("GROW")
            .with_line_item(LineItemDefinition::driver("REVENUE", StatementCategory::ProfitAndLoss))
            .with_line_item(LineItemDefinition::driver("UNITS", StatementCategory::Other));
        let graph = CalculationGraph::build(&template).unwrap();
        let actions = vec![
            ScenarioAction::unconditional("GROWTH", 2, None).with_transformation(Transformation::FormulaOverride {
                line_item: "REVENUE".to_string(),
                new_formula: "REVENUE[t-1] * 1.05 + PRICE[t-1]".to_string(),
            }),
            ScenarioAction::unconditional("BROKEN", 2, None).with_transformation(Transformation::FormulaOverride {
                line_item: "UNITS".to_string(),
                new_formula: "UNITS[t-1] +".to_string(),
            }),
        ];

        let carried = carried_time_shifted_codes(&graph, &actions);
        assert_eq!(carried, BTreeSet::from(["REVENUE".to_string()]));

        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "REVENUE", 1, &[100.0, 200.0]);
        drivers.insert_series("E1", 1, "UNITS", 1, &[5.0, 6.0]);
        let runner = runner(template, Arc::new(drivers));
        let request = RunRequest::new("E1", 1, "GROW", vec![1, 2]).with_actions(actions[..1].to_vec());
        let result = runner.run(&request).unwrap();

        assert!(!result.success);
        assert_eq!(result.errors[0].period_id, Some(2));
        assert!(result.errors[0].message.contains("PRICE"));
        assert!(!result.errors[0].message.contains("REVENUE[t-1]"));
    }

    #[test]
    fn test_closing_cash_threads_forward() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "CF_NET", 1, &[10.0, 20.0, 30.0]);
        let runner = runner(cash_template(), Arc::new(drivers));

        let request = RunRequest::new("E1", 1, "CASH_ONLY", vec![1, 2, 3]).with_seed_value("CASH", 100.0);
        let result = runner.run(&request).unwrap();

        assert!(result.success);
        assert_eq!(result.series("CASH"), vec![(1, 110.0), (2, 130.0), (3, 160.0)]);
        assert_eq!(result.closing_snapshot().unwrap()["CASH"], 160.0);
    }

    #[test]
    fn test_failure_stops_run_and_keeps_earlier_periods() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "CF_NET", 1, &[10.0, 20.0]);
        let runner = runner(cash_template(), Arc::new(drivers));

        let request = RunRequest::new("E1", 1, "CASH_ONLY", vec![1, 2, 3, 4]).with_seed_value("CASH", 0.0);
        let result = runner.run(&request).unwrap();

        assert!(!result.success);
        assert_eq!(result.periods.len(), 3);
        assert!(result.periods[1].success);
        assert!(!result.periods[2].success);
        assert!(result.periods[2].values.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].period_id, Some(3));
        assert_eq!(result.errors[0].kind, ErrorKind::Evaluation);
    }

    #[test]
    fn test_configuration_errors_are_err() {
        let runner = runner(cash_template(), Arc::new(MapProvider::new()));

        assert!(runner.run(&RunRequest::new("E1", 1, "CASH_ONLY", vec![])).is_err());
        assert!(runner.run(&RunRequest::new("E1", 1, "CASH_ONLY", vec![2, 1])).is_err());
        assert_eq!(
            runner
                .run(&RunRequest::new("E1", 1, "NOPE", vec![1]))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_cancellation_checked_per_period() {
        let runner = runner(cash_template(), Arc::new(MapProvider::new().with("CF_NET", 1.0)));
        runner.cancellation_token().cancel();

        let result = runner
            .run(&RunRequest::new("E1", 1, "CASH_ONLY", vec![1, 2]).with_seed_value("CASH", 0.0))
            .unwrap();
        assert!(!result.success);
        assert!(result.periods.is_empty());
        assert_eq!(result.errors[0].kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_batch_reports_each_scenario() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "CF_NET", 1, &[5.0, 5.0]);
        drivers.insert_series("E1", 2, "CF_NET", 1, &[5.0]);
        let runner = runner(cash_template(), Arc::new(drivers));

        let requests = vec![
            RunRequest::new("E1", 1, "CASH_ONLY", vec![1, 2]).with_seed_value("CASH", 0.0),
            RunRequest::new("E1", 2, "CASH_ONLY", vec![1, 2]).with_seed_value("CASH", 0.0),
            RunRequest::new("E1", 3, "MISSING", vec![1]),
        ];
        let results = runner.run_multiple_scenarios(&requests);

        assert_eq!(results.len(), 3);
        assert!(results[&1].success);
        assert!(!results[&2].success);
        assert_eq!(results[&2].periods.len(), 2);
        assert_eq!(results[&3].errors[0].kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_non_balance_sheet_time_shift_is_carried() {
        let template = StatementTemplate::new("GROWTH")
            .with_line_item(LineItemDefinition::computed(
                "REVENUE",
                "REVENUE[t-1] * 1.1",
                StatementCategory::ProfitAndLoss,
            ));
        let runner = runner(template, Arc::new(MapProvider::new()));

        let result = runner
            .run(&RunRequest::new("E1", 1, "GROWTH", vec![1, 2]).with_seed_value("REVENUE", 100.0))
            .unwrap();
        assert!(result.success);
        assert!((result.value(2, "REVENUE").unwrap() - 121.0).abs() < 1e-9);
    }
}
