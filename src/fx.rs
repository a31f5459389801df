use crate::error::{EngineError, Result};
use crate::providers::{Context, ValueProvider};
use crate::schema::PeriodId;
use crate::storage::{Database, Params};
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RateType {
    #[default]
    Average,
    Closing,
    Opening,
}

impl RateType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "average" | "avg" => Some(RateType::Average),
            "closing" => Some(RateType::Closing),
            "opening" => Some(RateType::Opening),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Average => "average",
            RateType::Closing => "closing",
            RateType::Opening => "opening",
        }
    }
}

/// Parsed `FX_<FROM>_<TO>[_<RATETYPE>]` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FxKey {
    pub from: String,
    pub to: String,
    pub rate_type: RateType,
}

impl FxKey {
    /// Case-insensitive; returns `None` for anything that is not an FX key.
    pub fn parse(key: &str) -> Option<Self> {
        let upper = key.trim().to_ascii_uppercase();
        let rest = upper.strip_prefix("FX_")?;
        let parts: Vec<&str> = rest.split('_').collect();

        let (from, to, rate_type) = match parts.as_slice() {
            [from, to] => (*from, *to, RateType::Average),
            [from, to, rate_type] => (*from, *to, RateType::parse(rate_type)?),
            _ => return None,
        };

        if !is_currency_code(from) || !is_currency_code(to) {
            return None;
        }

        Some(Self {
            from: from.to_string(),
            to: to.to_string(),
            rate_type,
        })
    }
}

pub fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic())
}

type RateKey = (String, String, PeriodId, RateType);

/// Exchange rates per `(from, to, period, rate type)`.
///
/// Only one direction needs to be stored; the reverse pair is inverted on lookup.
#[derive(Debug, Clone, Default)]
pub struct FxRateTable {
    rates: BTreeMap<RateKey, f64>,
}

impl FxRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: &str, to: &str, period_id: PeriodId, rate_type: RateType, rate: f64) {
        self.rates.insert(
            (from.to_ascii_uppercase(), to.to_ascii_uppercase(), period_id, rate_type),
            rate,
        );
    }

    pub fn with_rate(mut self, from: &str, to: &str, period_id: PeriodId, rate_type: RateType, rate: f64) -> Self {
        self.insert(from, to, period_id, rate_type, rate);
        self
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    fn direct(&self, from: &str, to: &str, period_id: PeriodId, rate_type: RateType) -> Option<f64> {
        self.rates
            .get(&(from.to_string(), to.to_string(), period_id, rate_type))
            .copied()
    }

    pub fn has_rate(&self, from: &str, to: &str, period_id: PeriodId, rate_type: RateType) -> bool {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        from == to
            || self.direct(&from, &to, period_id, rate_type).is_some()
            || self.direct(&to, &from, period_id, rate_type).is_some()
    }

    pub fn rate(&self, from: &str, to: &str, period_id: PeriodId, rate_type: RateType) -> Result<f64> {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();
        if from == to {
            return Ok(1.0);
        }

        if let Some(rate) = self.direct(&from, &to, period_id, rate_type) {
            return Ok(rate);
        }

        if let Some(reverse) = self.direct(&to, &from, period_id, rate_type) {
            if reverse == 0.0 {
                return Err(EngineError::UnitConversion(format!(
                    "zero {} rate stored for {}/{} in period {}",
                    rate_type.as_str(),
                    to,
                    from,
                    period_id
                )));
            }
            return Ok(1.0 / reverse);
        }

        Err(EngineError::MissingValue {
            key: format!("FX_{}_{}_{}", from, to, rate_type.as_str().to_ascii_uppercase()),
            context: format!("period {}", period_id),
        })
    }

    pub fn load_from_database(db: &dyn Database) -> Result<Self> {
        let mut rows = db.execute_query(
            "SELECT from_currency, to_currency, period_id, rate_type, rate FROM fx_rate",
            &Params::new(),
        )?;

        let mut table = Self::new();
        while rows.next() {
            let rate_type_text = rows.get_string("rate_type")?;
            let rate_type = RateType::parse(&rate_type_text).ok_or_else(|| {
                EngineError::Storage(format!("unknown FX rate type '{}'", rate_type_text))
            })?;
            table.insert(
                &rows.get_string("from_currency")?,
                &rows.get_string("to_currency")?,
                rows.get_i32("period_id")?,
                rate_type,
                rows.get_f64("rate")?,
            );
        }

        debug!("Loaded {} FX rates", table.len());
        Ok(table)
    }
}

/// Answers `FX_<FROM>_<TO>[_<RATETYPE>]` keys for the context's period.
#[derive(Debug, Clone)]
pub struct FxValueProvider {
    table: Arc<FxRateTable>,
}

impl FxValueProvider {
    pub fn new(table: Arc<FxRateTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<FxRateTable> {
        &self.table
    }
}

impl ValueProvider for FxValueProvider {
    fn name(&self) -> &str {
        "fx rates"
    }

    fn has_value(&self, key: &str, ctx: &Context) -> bool {
        match (FxKey::parse(key), ctx.effective_period_id()) {
            (Some(k), Ok(period_id)) => self.table.has_rate(&k.from, &k.to, period_id, k.rate_type),
            _ => false,
        }
    }

    fn get_value(&self, key: &str, ctx: &Context) -> Result<f64> {
        let parsed = FxKey::parse(key)
            .ok_or_else(|| EngineError::UnknownVariable(format!("{} is not an FX key", key)))?;
        self.table
            .rate(&parsed.from, &parsed.to, ctx.effective_period_id()?, parsed.rate_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteDatabase;

    fn table() -> Arc<FxRateTable> {
        Arc::new(
            FxRateTable::new()
                .with_rate("EUR", "USD", 1, RateType::Average, 1.10)
                .with_rate("EUR", "USD", 1, RateType::Closing, 1.12)
                .with_rate("GBP", "USD", 2, RateType::Average, 1.25),
        )
    }

    #[test]
    fn test_key_parsing() {
        let key = FxKey::parse("fx_eur_usd_closing").unwrap();
        assert_eq!(key.from, "EUR");
        assert_eq!(key.to, "USD");
        assert_eq!(key.rate_type, RateType::Closing);

        assert_eq!(FxKey::parse("FX_EUR_USD").unwrap().rate_type, RateType::Average);
        assert!(FxKey::parse("FX_EURO_USD").is_none());
        assert!(FxKey::parse("FX_EUR_USD_SPOT").is_none());
        assert!(FxKey::parse("REVENUE").is_none());
    }

    #[test]
    fn test_direct_reverse_and_identity() {
        let provider = FxValueProvider::new(table());
        let ctx = Context::new(1, 1, "E1");

        assert!((provider.get_value("FX_EUR_USD", &ctx).unwrap() - 1.10).abs() < 1e-9);
        assert!((provider.get_value("FX_EUR_USD_CLOSING", &ctx).unwrap() - 1.12).abs() < 1e-9);
        assert!((provider.get_value("FX_USD_EUR", &ctx).unwrap() - 1.0 / 1.10).abs() < 1e-9);
        assert!((provider.get_value("FX_USD_USD", &ctx).unwrap() - 1.0).abs() < 1e-9);

        assert!(!provider.has_value("FX_EUR_USD_OPENING", &ctx));
        assert!(!provider.has_value("FX_GBP_USD", &ctx));
        assert!(provider.has_value("FX_GBP_USD", &Context::new(1, 2, "E1")));
    }

    #[test]
    fn test_rates_used_in_formula() {
        let provider = FxValueProvider::new(table());
        let ctx = Context::new(1, 1, "E1");
        let value = crate::formula::evaluate("1000 * FX_EUR_USD", &[&provider], &ctx).unwrap();
        assert!((value - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_database() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db.execute_update(
            "INSERT INTO fx_rate (from_currency, to_currency, period_id, rate_type, rate)
             VALUES ('NZD', 'USD', 3, 'closing', 0.6)",
            &Params::new(),
        )
        .unwrap();

        let table = FxRateTable::load_from_database(&db).unwrap();
        assert!((table.rate("usd", "nzd", 3, RateType::Closing).unwrap() - 1.0 / 0.6).abs() < 1e-9);
        assert!(table.rate("USD", "NZD", 3, RateType::Average).is_err());
    }
}
