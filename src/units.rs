use crate::error::{EngineError, Result};
use crate::fx::{FxRateTable, RateType};
use crate::schema::PeriodId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitCategory {
    Mass,
    Carbon,
    Energy,
    Volume,
    Currency,
}

impl fmt::Display for UnitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitCategory::Mass => "MASS",
            UnitCategory::Carbon => "CARBON",
            UnitCategory::Energy => "ENERGY",
            UnitCategory::Volume => "VOLUME",
            UnitCategory::Currency => "CURRENCY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionKind {
    /// Fixed factor to the base unit.
    Static,
    /// Factor depends on the period (currencies, via FX rates).
    TimeVarying,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnitDefinition {
    pub code: String,
    pub category: UnitCategory,
    /// Multiply by this to reach the base unit. Ignored for time-varying units.
    pub factor_to_base: f64,
    pub kind: ConversionKind,
}

const BUILTIN_UNITS: &[(&str, UnitCategory, f64)] = &[
    ("kg", UnitCategory::Mass, 1.0),
    ("g", UnitCategory::Mass, 0.001),
    ("t", UnitCategory::Mass, 1000.0),
    ("lb", UnitCategory::Mass, 0.453_592_37),
    ("tCO2e", UnitCategory::Carbon, 1.0),
    ("kgCO2e", UnitCategory::Carbon, 0.001),
    ("MtCO2e", UnitCategory::Carbon, 1_000_000.0),
    ("kWh", UnitCategory::Energy, 1.0),
    ("MWh", UnitCategory::Energy, 1000.0),
    ("GWh", UnitCategory::Energy, 1_000_000.0),
    ("GJ", UnitCategory::Energy, 277.777_777_777_777_8),
    ("L", UnitCategory::Volume, 1.0),
    ("m3", UnitCategory::Volume, 1000.0),
];

const BUILTIN_CURRENCIES: &[&str] = &["USD", "EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "NZD", "CNY"];

/// Converts quantities to and from the base unit of their category.
///
/// Base units: `kg`, `tCO2e`, `kWh`, `L`, and the configured base currency.
/// Currency conversions are time-varying and need a period plus an FX table.
#[derive(Debug, Clone)]
pub struct UnitConverter {
    units: BTreeMap<String, UnitDefinition>,
    base_currency: String,
    fx: Option<Arc<FxRateTable>>,
    rate_type: RateType,
}

impl Default for UnitConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitConverter {
    pub fn new() -> Self {
        let mut converter = Self {
            units: BTreeMap::new(),
            base_currency: "USD".to_string(),
            fx: None,
            rate_type: RateType::Average,
        };
        for (code, category, factor) in BUILTIN_UNITS {
            converter.register(UnitDefinition {
                code: code.to_string(),
                category: *category,
                factor_to_base: *factor,
                kind: ConversionKind::Static,
            });
        }
        for code in BUILTIN_CURRENCIES {
            converter.register_currency(code);
        }
        converter
    }

    pub fn with_fx(mut self, fx: Arc<FxRateTable>, base_currency: &str) -> Self {
        self.fx = Some(fx);
        self.base_currency = base_currency.to_ascii_uppercase();
        self.register_currency(base_currency);
        self
    }

    pub fn with_rate_type(mut self, rate_type: RateType) -> Self {
        self.rate_type = rate_type;
        self
    }

    pub fn register(&mut self, definition: UnitDefinition) {
        self.units.insert(definition.code.clone(), definition);
    }

    pub fn register_currency(&mut self, code: &str) {
        let code = code.to_ascii_uppercase();
        self.register(UnitDefinition {
            code: code.clone(),
            category: UnitCategory::Currency,
            factor_to_base: 1.0,
            kind: ConversionKind::TimeVarying,
        });
    }

    pub fn is_known(&self, unit: &str) -> bool {
        self.units.contains_key(unit)
    }

    fn definition(&self, unit: &str) -> Result<&UnitDefinition> {
        self.units
            .get(unit)
            .ok_or_else(|| EngineError::UnitConversion(format!("unknown unit '{}'", unit)))
    }

    pub fn category_of(&self, unit: &str) -> Result<UnitCategory> {
        Ok(self.definition(unit)?.category)
    }

    pub fn base_unit_of(&self, category: UnitCategory) -> &str {
        match category {
            UnitCategory::Mass => "kg",
            UnitCategory::Carbon => "tCO2e",
            UnitCategory::Energy => "kWh",
            UnitCategory::Volume => "L",
            UnitCategory::Currency => &self.base_currency,
        }
    }

    fn factor(&self, definition: &UnitDefinition, period_id: Option<PeriodId>) -> Result<f64> {
        let factor = match definition.kind {
            ConversionKind::Static => definition.factor_to_base,
            ConversionKind::TimeVarying => {
                if definition.code == self.base_currency {
                    return Ok(1.0);
                }
                let period = period_id.ok_or_else(|| {
                    EngineError::UnitConversion(format!(
                        "a period is required to convert time-varying unit '{}'",
                        definition.code
                    ))
                })?;
                let fx = self.fx.as_ref().ok_or_else(|| {
                    EngineError::UnitConversion(format!(
                        "no FX rates configured to convert '{}'",
                        definition.code
                    ))
                })?;
                fx.rate(&definition.code, &self.base_currency, period, self.rate_type)?
            }
        };

        if factor.abs() < 1e-10 {
            return Err(EngineError::UnitConversion(format!(
                "zero conversion factor for '{}'",
                definition.code
            )));
        }
        Ok(factor)
    }

    pub fn to_base_unit(&self, value: f64, unit: &str, period_id: Option<PeriodId>) -> Result<f64> {
        let definition = self.definition(unit)?;
        Ok(value * self.factor(definition, period_id)?)
    }

    pub fn from_base_unit(&self, value: f64, unit: &str, period_id: Option<PeriodId>) -> Result<f64> {
        let definition = self.definition(unit)?;
        Ok(value / self.factor(definition, period_id)?)
    }

    pub fn convert(&self, value: f64, from: &str, to: &str, period_id: Option<PeriodId>) -> Result<f64> {
        let from_category = self.category_of(from)?;
        let to_category = self.category_of(to)?;
        if from_category != to_category {
            return Err(EngineError::UnitConversion(format!(
                "cannot convert {} ({}) to {} ({})",
                from, from_category, to, to_category
            )));
        }

        let base = self.to_base_unit(value, from, period_id)?;
        self.from_base_unit(base, to, period_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_static_conversions() {
        let converter = UnitConverter::new();
        assert!((converter.to_base_unit(2.5, "t", None).unwrap() - 2500.0).abs() < 1e-9);
        assert!((converter.convert(1500.0, "kgCO2e", "tCO2e", None).unwrap() - 1.5).abs() < 1e-9);
        assert!((converter.convert(3.6, "GJ", "MWh", None).unwrap() - 1.0).abs() < 1e-9);
        assert!((converter.convert(2.0, "m3", "L", None).unwrap() - 2000.0).abs() < 1e-9);
        assert_eq!(converter.base_unit_of(UnitCategory::Carbon), "tCO2e");
    }

    #[test]
    fn test_cross_category_conversion_fails() {
        let converter = UnitConverter::new();
        let err = converter.convert(1.0, "tCO2e", "kg", None).unwrap_err();
        assert!(matches!(err, EngineError::UnitConversion(_)));
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert!(converter.convert(1.0, "furlong", "kg", None).is_err());
    }

    #[test]
    fn test_currency_requires_period_and_rates() {
        let fx = Arc::new(
            FxRateTable::new()
                .with_rate("EUR", "USD", 4, RateType::Average, 1.2)
                .with_rate("USD", "GBP", 4, RateType::Average, 0.8),
        );
        let converter = UnitConverter::new().with_fx(fx, "USD");

        assert!((converter.to_base_unit(100.0, "EUR", Some(4)).unwrap() - 120.0).abs() < 1e-9);
        assert!((converter.to_base_unit(80.0, "GBP", Some(4)).unwrap() - 100.0).abs() < 1e-9);
        assert!((converter.convert(100.0, "EUR", "GBP", Some(4)).unwrap() - 96.0).abs() < 1e-9);
        assert!((converter.to_base_unit(5.0, "USD", None).unwrap() - 5.0).abs() < 1e-9);

        assert!(converter.to_base_unit(100.0, "EUR", None).is_err());
        assert!(converter.to_base_unit(100.0, "EUR", Some(5)).is_err());
        assert!(UnitConverter::new().to_base_unit(1.0, "EUR", Some(4)).is_err());
    }
}
