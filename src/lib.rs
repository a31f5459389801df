//! # Financial Scenario Engine
//!
//! Computes multi-period financial statements from formula templates, with
//! scenario drivers supplied by pluggable providers and management actions that
//! rewrite the template when their triggers fire.
//!
//! ## Core Concepts
//!
//! - **Statement Template**: Ordered line items, each computed by a formula
//!   (`GROSS_PROFIT = REVENUE - COGS`) or read from the provider chain
//! - **Time References**: `CASH[t-1]` reads the closing value of an earlier
//!   period; the run's seed stands in for the period before the first
//! - **Providers**: Scenario drivers, FX rates and unit-converted quantities,
//!   consulted in registration order
//! - **Actions**: Transformations (formula override, multiply, add, reduce)
//!   applied to a cloned template variant while the action is active
//! - **Accounting Integrity**: `TOTAL_ASSETS = TOTAL_LIABILITIES + TOTAL_EQUITY`
//!   is checked every period that computes all three
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_scenario_engine::*;
//! use std::sync::Arc;
//!
//! let template = StatementTemplate::new("CASH_ONLY")
//!     .with_line_item(LineItemDefinition::driver("CF_NET", StatementCategory::CashFlow))
//!     .with_line_item(LineItemDefinition::computed(
//!         "CASH",
//!         "CASH[t-1] + CF_NET",
//!         StatementCategory::BalanceSheet,
//!     ));
//!
//! let mut drivers = DriverValueProvider::new();
//! drivers.insert_series("ACME", 1, "CF_NET", 1, &[40_000.0, 45_000.0, 50_000.0]);
//!
//! let request = RunRequest::new("ACME", 1, "CASH_ONLY", vec![1, 2, 3])
//!     .with_seed_value("CASH", 1_000_000.0);
//!
//! let providers: Vec<Arc<dyn ValueProvider>> = vec![Arc::new(drivers)];
//! let result = run_template(template, EngineConfig::default(), providers, &request)?;
//! assert_eq!(result.value(3, "CASH"), Some(1_135_000.0));
//! ```

pub mod actions;
pub mod balancer;
pub mod engine;
pub mod error;
pub mod formula;
pub mod fx;
pub mod orchestrator;
pub mod providers;
pub mod sampling;
pub mod scenarios;
pub mod schema;
pub mod statements;
pub mod storage;
pub mod units;
pub mod utils;

pub use actions::{
    apply_actions_to_template, apply_transformations, load_scenario_actions, parse_transformations,
    save_scenario_action, ActionEngine, TriggerState, TriggerTracker, TriggerUpdate,
};
pub use balancer::{verify_accounting_equation, AccountingBalancer, BalanceCheck};
pub use engine::{CalculationGraph, RuleViolation, SnapshotHistory, ValueMap};
pub use error::{EngineError, ErrorKind, Result};
pub use formula::{evaluate, extract_dependencies, Formula, Resolver, VariableRef};
pub use fx::{FxRateTable, FxValueProvider, RateType};
pub use orchestrator::{CancellationToken, PeriodResult, PeriodRunner, RunIssue, RunRequest, RunResult};
pub use providers::{Context, DriverValueProvider, MapProvider, ProviderChain, ValueProvider};
pub use sampling::NoisyDriverProvider;
pub use scenarios::{ScenarioConfig, ScenarioGenerator};
pub use schema::*;
pub use statements::{FinancialStatements, StatementLine};
pub use storage::{
    Database, InMemoryTemplateStore, Params, ResultSet, SqlTemplateStore, SqliteDatabase, TemplateStore,
};
pub use units::{UnitCategory, UnitConverter};
pub use utils::PeriodCalendar;

use log::info;
use std::sync::Arc;

/// Runs one request against a template that lives only in memory.
///
/// Template variants materialized for active actions are kept in the same
/// in-memory store and dropped with it.
pub fn run_template(
    template: StatementTemplate,
    config: EngineConfig,
    providers: Vec<Arc<dyn ValueProvider>>,
    request: &RunRequest,
) -> Result<RunResult> {
    template.validate()?;
    info!(
        "Running template '{}' ({} line items) for entity {}",
        template.code,
        template.line_items.len(),
        request.entity_id
    );

    let store = Arc::new(InMemoryTemplateStore::new().with_template(template));
    let runner = providers
        .into_iter()
        .fold(PeriodRunner::new(store, config), |runner, provider| {
            runner.with_provider(provider)
        });
    runner.run(request)
}

/// Loads a template, its drivers, FX rates and the scenario's actions from a
/// SQLite database and runs the requested periods.
///
/// Currency-denominated drivers are converted into `config.base_currency`.
pub fn run_from_database(
    db: Arc<SqliteDatabase>,
    config: EngineConfig,
    entity_id: &str,
    scenario_id: ScenarioId,
    base_template_code: &str,
    period_ids: Vec<PeriodId>,
    seed: ValueMap,
) -> Result<RunResult> {
    config.validate()?;
    let fx = Arc::new(FxRateTable::load_from_database(db.as_ref())?);
    let converter = Arc::new(UnitConverter::new().with_fx(fx.clone(), &config.base_currency));
    let drivers = DriverValueProvider::load_from_database(db.as_ref(), entity_id, scenario_id)?
        .with_converter(converter);
    let actions = load_scenario_actions(db.as_ref(), scenario_id)?;

    let mut request = RunRequest::new(entity_id, scenario_id, base_template_code, period_ids).with_actions(actions);
    request.seed = seed;

    let store = Arc::new(SqlTemplateStore::new(db));
    PeriodRunner::new(store, config)
        .with_provider(Arc::new(drivers))
        .with_provider(Arc::new(FxValueProvider::new(fx)))
        .run(&request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> StatementTemplate {
        StatementTemplate::new("CASH_ONLY")
            .with_line_item(LineItemDefinition::driver("CF_NET", StatementCategory::CashFlow))
            .with_line_item(LineItemDefinition::computed(
                "CASH",
                "CASH[t-1] + CF_NET",
                StatementCategory::BalanceSheet,
            ))
    }

    #[test]
    fn test_run_template_end_to_end() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("ACME", 1, "CF_NET", 1, &[40_000.0, 45_000.0, 50_000.0]);

        let providers: Vec<Arc<dyn ValueProvider>> = vec![Arc::new(drivers)];
        let request = RunRequest::new("ACME", 1, "CASH_ONLY", vec![1, 2, 3]).with_seed_value("CASH", 1_000_000.0);
        let result = run_template(template(), EngineConfig::default(), providers, &request).unwrap();

        assert!(result.success);
        assert!((result.value(3, "CASH").unwrap() - 1_135_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_run_template_rejects_invalid_template() {
        let template = template().with_line_item(LineItemDefinition::driver("CASH", StatementCategory::Other));
        let request = RunRequest::new("ACME", 1, "CASH_ONLY", vec![1]);
        let err = run_template(template, EngineConfig::default(), Vec::new(), &request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
