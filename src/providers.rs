use crate::error::{EngineError, Result};
use crate::formula::{Resolver, VariableRef};
use crate::schema::{PeriodId, ScenarioId};
use crate::storage::{Database, Params};
use crate::units::UnitConverter;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Prefix marking an explicit driver lookup, e.g. `driver:REVENUE_BASE`.
pub const DRIVER_PREFIX: &str = "driver:";

/// Lookup coordinates handed to every provider.
///
/// `lag` is non-zero when a time-shifted reference is being resolved; providers
/// should read data for [`Context::effective_period_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    pub scenario_id: ScenarioId,
    pub period_id: PeriodId,
    pub entity_id: String,
    #[serde(default)]
    pub lag: u32,
}

impl Context {
    pub fn new(scenario_id: ScenarioId, period_id: PeriodId, entity_id: impl Into<String>) -> Self {
        Self {
            scenario_id,
            period_id,
            entity_id: entity_id.into(),
            lag: 0,
        }
    }

    /// The same coordinates moved `lag` further back.
    pub fn shifted(&self, lag: u32) -> Result<Self> {
        let out_of_range = || EngineError::TimeShiftOutOfRange {
            period_id: self.period_id,
            lag: u64::from(self.lag) + u64::from(lag),
        };
        let ctx = Self {
            lag: self.lag.checked_add(lag).ok_or_else(out_of_range)?,
            ..self.clone()
        };
        ctx.effective_period_id()?;
        Ok(ctx)
    }

    pub fn effective_period_id(&self) -> Result<PeriodId> {
        PeriodId::try_from(self.lag)
            .ok()
            .and_then(|lag| self.period_id.checked_sub(lag))
            .ok_or(EngineError::TimeShiftOutOfRange {
                period_id: self.period_id,
                lag: u64::from(self.lag),
            })
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.effective_period_id() {
            Ok(period_id) => write!(
                f,
                "entity {}, scenario {}, period {}",
                self.entity_id, self.scenario_id, period_id
            ),
            Err(_) => write!(
                f,
                "entity {}, scenario {}, period {} shifted back {}",
                self.entity_id, self.scenario_id, self.period_id, self.lag
            ),
        }
    }
}

/// A source of leaf values: scenario drivers, FX rates, converted quantities.
pub trait ValueProvider: Send + Sync {
    fn name(&self) -> &str;
    fn has_value(&self, key: &str, ctx: &Context) -> bool;
    fn get_value(&self, key: &str, ctx: &Context) -> Result<f64>;
}

/// Tries each provider in order. A provider that claims `key` but then fails
/// is skipped so a lower-priority provider can still answer.
pub fn lookup(providers: &[&dyn ValueProvider], key: &str, ctx: &Context) -> Result<f64> {
    let mut claimed = false;
    for provider in providers {
        if !provider.has_value(key, ctx) {
            continue;
        }
        claimed = true;
        match provider.get_value(key, ctx) {
            Ok(value) => {
                debug!("'{}' resolved by {} ({}) = {}", key, provider.name(), ctx, value);
                return Ok(value);
            }
            Err(e) => debug!("{} failed for '{}' ({}): {}", provider.name(), key, ctx, e),
        }
    }

    if claimed {
        Err(EngineError::MissingValue {
            key: key.to_string(),
            context: ctx.to_string(),
        })
    } else {
        Err(EngineError::UnknownVariable(key.to_string()))
    }
}

/// Resolves formula variables purely from providers, shifting the context
/// back by each reference's lag.
pub struct ProviderChain<'a> {
    providers: Vec<&'a dyn ValueProvider>,
    ctx: &'a Context,
}

impl<'a> ProviderChain<'a> {
    pub fn new(providers: &[&'a dyn ValueProvider], ctx: &'a Context) -> Self {
        Self {
            providers: providers.to_vec(),
            ctx,
        }
    }

    pub fn from_shared(providers: &'a [Arc<dyn ValueProvider>], ctx: &'a Context) -> Self {
        Self {
            providers: providers.iter().map(|p| p.as_ref()).collect(),
            ctx,
        }
    }

    pub fn get(&self, key: &str, ctx: &Context) -> Result<f64> {
        lookup(&self.providers, key, ctx)
    }
}

impl Resolver for ProviderChain<'_> {
    fn resolve(&self, var: &VariableRef) -> Result<f64> {
        let ctx = self.ctx.shifted(var.lag)?;
        self.get(&var.name, &ctx)
    }
}

/// Period-independent code → value map.
#[derive(Debug, Clone)]
pub struct MapProvider {
    name: String,
    values: BTreeMap<String, f64>,
}

impl Default for MapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MapProvider {
    pub fn new() -> Self {
        Self::named("map")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }
}

impl ValueProvider for MapProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_value(&self, key: &str, _ctx: &Context) -> bool {
        self.values.contains_key(key)
    }

    fn get_value(&self, key: &str, ctx: &Context) -> Result<f64> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| EngineError::MissingValue {
                key: key.to_string(),
                context: ctx.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverValue {
    pub value: f64,
    pub unit: Option<String>,
}

type DriverKey = (String, ScenarioId, PeriodId, String);

/// Scenario driver rows keyed by `(entity, scenario, period, driver_code)`.
///
/// Keys may carry the `driver:` prefix. When a [`UnitConverter`] is attached,
/// values stored in a known unit are returned in their category's base unit.
#[derive(Debug, Clone, Default)]
pub struct DriverValueProvider {
    rows: BTreeMap<DriverKey, DriverValue>,
    converter: Option<Arc<UnitConverter>>,
}

impl DriverValueProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_converter(mut self, converter: Arc<UnitConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn insert(
        &mut self,
        entity_id: &str,
        scenario_id: ScenarioId,
        period_id: PeriodId,
        driver_code: &str,
        value: f64,
        unit: Option<&str>,
    ) {
        let code = driver_code.strip_prefix(DRIVER_PREFIX).unwrap_or(driver_code);
        self.rows.insert(
            (entity_id.to_string(), scenario_id, period_id, code.to_string()),
            DriverValue {
                value,
                unit: unit.map(str::to_string),
            },
        );
    }

    /// Convenience for one driver over consecutive periods starting at `first_period`.
    pub fn insert_series(
        &mut self,
        entity_id: &str,
        scenario_id: ScenarioId,
        driver_code: &str,
        first_period: PeriodId,
        values: &[f64],
    ) {
        for (offset, value) in values.iter().enumerate() {
            self.insert(
                entity_id,
                scenario_id,
                first_period + offset as PeriodId,
                driver_code,
                *value,
                None,
            );
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn load_from_database(
        db: &dyn Database,
        entity_id: &str,
        scenario_id: ScenarioId,
    ) -> Result<Self> {
        let mut rows = db.execute_query(
            "SELECT period_id, driver_code, value, unit_code FROM scenario_driver
             WHERE entity_id = :entity_id AND scenario_id = :scenario_id
             ORDER BY period_id, driver_code",
            &Params::new()
                .with("entity_id", entity_id)
                .with("scenario_id", scenario_id),
        )?;

        let mut provider = Self::new();
        while rows.next() {
            let unit = rows.get_opt_string("unit_code")?;
            provider.insert(
                entity_id,
                scenario_id,
                rows.get_i32("period_id")?,
                &rows.get_string("driver_code")?,
                rows.get_f64("value")?,
                unit.as_deref(),
            );
        }

        debug!(
            "Loaded {} driver rows for entity {} scenario {}",
            provider.len(),
            entity_id,
            scenario_id
        );
        Ok(provider)
    }

    fn row(&self, key: &str, ctx: &Context) -> Option<&DriverValue> {
        let code = key.strip_prefix(DRIVER_PREFIX).unwrap_or(key);
        self.rows.get(&(
            ctx.entity_id.clone(),
            ctx.scenario_id,
            ctx.effective_period_id().ok()?,
            code.to_string(),
        ))
    }
}

impl ValueProvider for DriverValueProvider {
    fn name(&self) -> &str {
        "scenario drivers"
    }

    fn has_value(&self, key: &str, ctx: &Context) -> bool {
        self.row(key, ctx).is_some()
    }

    fn get_value(&self, key: &str, ctx: &Context) -> Result<f64> {
        let row = self.row(key, ctx).ok_or_else(|| EngineError::MissingValue {
            key: key.to_string(),
            context: ctx.to_string(),
        })?;

        match (&self.converter, row.unit.as_deref()) {
            (Some(converter), Some(unit)) if converter.is_known(unit) => {
                converter.to_base_unit(row.value, unit, Some(ctx.effective_period_id()?))
            }
            _ => Ok(row.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{upsert_driver, SqliteDatabase};

    struct FailingProvider;

    impl ValueProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn has_value(&self, _key: &str, _ctx: &Context) -> bool {
            true
        }

        fn get_value(&self, key: &str, _ctx: &Context) -> Result<f64> {
            Err(EngineError::Storage(format!("cannot read {}", key)))
        }
    }

    #[test]
    fn test_context_shift() {
        let ctx = Context::new(2, 7, "E1");
        let shifted = ctx.shifted(2).unwrap();
        assert_eq!(shifted.period_id, 7);
        assert_eq!(shifted.effective_period_id().unwrap(), 5);
        assert_eq!(shifted.shifted(1).unwrap().effective_period_id().unwrap(), 4);
    }

    #[test]
    fn test_context_shift_out_of_range() {
        let ctx = Context::new(1, 2, "E1");
        assert!(matches!(
            ctx.shifted(u32::MAX),
            Err(EngineError::TimeShiftOutOfRange { .. })
        ));
        assert!(matches!(
            ctx.shifted(i32::MAX as u32).unwrap().shifted(i32::MAX as u32),
            Err(EngineError::TimeShiftOutOfRange { .. })
        ));

        let lagged = Context { lag: 1u32 << 31, ..ctx };
        assert!(lagged.effective_period_id().is_err());
        assert!(lagged.to_string().contains("shifted back"));

        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "PRICE", 1, &[10.0, 20.0, 30.0]);
        assert!(!drivers.has_value("PRICE", &lagged));
    }

    #[test]
    fn test_failing_provider_falls_through() {
        let failing = FailingProvider;
        let map = MapProvider::new().with("REVENUE", 10.0);
        let ctx = Context::new(1, 1, "E1");

        assert!((lookup(&[&failing, &map], "REVENUE", &ctx).unwrap() - 10.0).abs() < 1e-9);
        assert!(matches!(
            lookup(&[&failing], "REVENUE", &ctx),
            Err(EngineError::MissingValue { .. })
        ));
        assert!(matches!(
            lookup(&[&map], "COGS", &ctx),
            Err(EngineError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_driver_provider_prefix_and_lag() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "REVENUE_BASE", 1, &[100.0, 110.0, 121.0]);
        let ctx = Context::new(1, 3, "E1");

        assert!((drivers.get_value("driver:REVENUE_BASE", &ctx).unwrap() - 121.0).abs() < 1e-9);
        assert!((drivers.get_value("REVENUE_BASE", &ctx.shifted(2).unwrap()).unwrap() - 100.0).abs() < 1e-9);
        assert!(!drivers.has_value("REVENUE_BASE", &Context::new(2, 3, "E1")));
        assert!(!drivers.has_value("REVENUE_BASE", &Context::new(1, 3, "E2")));
    }

    #[test]
    fn test_provider_chain_resolves_time_shifted_reference() {
        let mut drivers = DriverValueProvider::new();
        drivers.insert_series("E1", 1, "PRICE", 1, &[10.0, 12.0]);
        let ctx = Context::new(1, 2, "E1");

        let value = crate::formula::evaluate("PRICE - PRICE[t-1]", &[&drivers], &ctx).unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_driver_provider_loads_from_database() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.init_schema().unwrap();
        upsert_driver(&db, "E1", 1, 1, "REVENUE", 1000.0, None).unwrap();
        upsert_driver(&db, "E1", 1, 2, "REVENUE", 1200.0, None).unwrap();
        upsert_driver(&db, "E1", 2, 1, "REVENUE", 9999.0, None).unwrap();

        let drivers = DriverValueProvider::load_from_database(&db, "E1", 1).unwrap();
        assert_eq!(drivers.len(), 2);
        let value = drivers.get_value("REVENUE", &Context::new(1, 2, "E1")).unwrap();
        assert!((value - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_driver_units_convert_to_base() {
        let converter = Arc::new(UnitConverter::new());
        let mut drivers = DriverValueProvider::new().with_converter(converter);
        drivers.insert("E1", 1, 1, "EMISSIONS", 2500.0, Some("kgCO2e"));
        drivers.insert("E1", 1, 1, "HEADCOUNT", 12.0, Some("people"));
        let ctx = Context::new(1, 1, "E1");

        assert!((drivers.get_value("EMISSIONS", &ctx).unwrap() - 2.5).abs() < 1e-9);
        assert!((drivers.get_value("HEADCOUNT", &ctx).unwrap() - 12.0).abs() < 1e-9);
    }
}
