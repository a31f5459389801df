use crate::error::{EngineError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub type PeriodId = i32;
pub type ScenarioId = i32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema, Default)]
pub enum StatementCategory {
    #[serde(rename = "PL", alias = "profit_and_loss", alias = "pl")]
    #[schemars(description = "Profit & loss line item: activity over the period (revenue, costs, net income)")]
    ProfitAndLoss,

    #[serde(rename = "BS", alias = "balance_sheet", alias = "bs")]
    #[schemars(description = "Balance sheet line item: closing balance carried into the next period's opening state")]
    BalanceSheet,

    #[serde(rename = "CF", alias = "cash_flow", alias = "cf")]
    #[schemars(description = "Cash flow line item: movement of cash during the period")]
    CashFlow,

    #[default]
    #[serde(rename = "OTHER", alias = "other")]
    #[schemars(description = "Metrics and non-financial quantities such as emissions or energy use")]
    Other,
}

impl StatementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementCategory::ProfitAndLoss => "PL",
            StatementCategory::BalanceSheet => "BS",
            StatementCategory::CashFlow => "CF",
            StatementCategory::Other => "OTHER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PL" | "PROFIT_AND_LOSS" => Some(StatementCategory::ProfitAndLoss),
            "BS" | "BALANCE_SHEET" => Some(StatementCategory::BalanceSheet),
            "CF" | "CASH_FLOW" => Some(StatementCategory::CashFlow),
            "OTHER" | "" => Some(StatementCategory::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentOp {
    #[schemars(description = "value * operand")]
    Multiply,
    #[schemars(description = "value + operand")]
    Add,
    #[schemars(description = "value - operand")]
    Reduce,
}

/// A post-evaluation adjustment left behind by a `multiply`, `add` or
/// `reduce` transformation. The line item's own formula is untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ValueAdjustment {
    pub op: AdjustmentOp,
    pub operand: f64,
}

impl ValueAdjustment {
    pub fn apply(&self, value: f64) -> f64 {
        match self.op {
            AdjustmentOp::Multiply => value * self.operand,
            AdjustmentOp::Add => value + self.operand,
            AdjustmentOp::Reduce => value - self.operand,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct LineItemDefinition {
    #[schemars(description = "Unique code of the line item within its template (e.g. 'REVENUE', 'CASH')")]
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Human readable label for reports")]
    pub display_name: Option<String>,

    #[serde(default)]
    #[schemars(
        description = "Expression computing the value, e.g. 'REVENUE - COGS' or 'CASH[t-1] + CF_NET'. When absent the value comes from the provider chain."
    )]
    pub formula: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(
        description = "Provider key used for driver-backed items, e.g. 'driver:REVENUE_BASE'. Defaults to the line item code."
    )]
    pub base_value_source: Option<String>,

    #[serde(default)]
    #[schemars(description = "Statement the line item is reported on. Informational for scheduling.")]
    pub category: StatementCategory,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(
        description = "Whether the closing value is carried into the next period's opening state. Defaults to true for balance sheet items."
    )]
    pub carry_forward: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(description = "Adjustments applied after the base value is computed, in order")]
    pub adjustments: Vec<ValueAdjustment>,
}

impl LineItemDefinition {
    pub fn computed(code: &str, formula: &str, category: StatementCategory) -> Self {
        Self {
            code: code.to_string(),
            display_name: None,
            formula: Some(formula.to_string()),
            base_value_source: None,
            category,
            carry_forward: None,
            adjustments: Vec::new(),
        }
    }

    pub fn driver(code: &str, category: StatementCategory) -> Self {
        Self {
            code: code.to_string(),
            display_name: None,
            formula: None,
            base_value_source: None,
            category,
            carry_forward: None,
            adjustments: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.base_value_source = Some(source.to_string());
        self
    }

    pub fn with_carry_forward(mut self, carry: bool) -> Self {
        self.carry_forward = Some(carry);
        self
    }

    pub fn is_computed(&self) -> bool {
        self.formula.is_some()
    }

    pub fn is_carry_forward(&self) -> bool {
        self.carry_forward
            .unwrap_or(self.category == StatementCategory::BalanceSheet)
    }

    /// Key handed to the provider chain when the item has no formula.
    pub fn provider_key(&self) -> &str {
        self.base_value_source.as_deref().unwrap_or(&self.code)
    }

    pub fn apply_adjustments(&self, base: f64) -> f64 {
        self.adjustments
            .iter()
            .fold(base, |value, adjustment| adjustment.apply(value))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    #[default]
    #[schemars(description = "Passes when |value| <= tolerance, e.g. 'TOTAL_ASSETS - TOTAL_LIABILITIES - TOTAL_EQUITY'")]
    Equation,
    #[schemars(description = "Passes when value >= -tolerance, e.g. 'CASH' must not go negative")]
    Boundary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ValidationRule {
    pub rule_id: String,

    #[schemars(description = "Expression evaluated against the period's computed values")]
    pub formula: String,

    #[serde(default)]
    pub kind: RuleKind,

    #[serde(default = "default_rule_tolerance")]
    pub tolerance: f64,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_rule_tolerance() -> f64 {
    0.01
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct StatementTemplate {
    #[schemars(description = "Template identity, e.g. 'CORP_UNIFIED_001'")]
    pub code: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Template this one was cloned from, if any")]
    pub parent_code: Option<String>,

    #[schemars(description = "Ordered line items. Order breaks ties in the evaluation schedule.")]
    pub line_items: Vec<LineItemDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_rules: Vec<ValidationRule>,
}

fn default_version() -> u32 {
    1
}

impl StatementTemplate {
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            version: 1,
            description: None,
            parent_code: None,
            line_items: Vec::new(),
            validation_rules: Vec::new(),
        }
    }

    pub fn with_line_item(mut self, item: LineItemDefinition) -> Self {
        self.line_items.push(item);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    pub fn line_item(&self, code: &str) -> Option<&LineItemDefinition> {
        self.line_items.iter().find(|item| item.code == code)
    }

    pub fn line_item_mut(&mut self, code: &str) -> Option<&mut LineItemDefinition> {
        self.line_items.iter_mut().find(|item| item.code == code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.line_item(code).is_some()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.line_items.iter().map(|item| item.code.as_str())
    }

    /// Rejects empty or duplicated line-item codes.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "template code must not be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for item in &self.line_items {
            if item.code.trim().is_empty() {
                return Err(EngineError::InvalidConfiguration(format!(
                    "template '{}' has a line item with an empty code",
                    self.code
                )));
            }
            if !seen.insert(item.code.as_str()) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "template '{}' defines line item '{}' more than once",
                    self.code, item.code
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let template: StatementTemplate = serde_json::from_str(json)?;
        template.validate()?;
        Ok(template)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(StatementTemplate)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    #[serde(alias = "unconditional")]
    #[schemars(description = "Active for every period in [start_period, end_period]")]
    Unconditional,

    #[serde(alias = "conditional")]
    #[schemars(
        description = "Active from start_period onwards whenever trigger_condition held in the previous period"
    )]
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    #[schemars(description = "Replace the line item's formula outright")]
    FormulaOverride {
        line_item: String,
        new_formula: String,
    },

    #[schemars(description = "Scale the line item's computed value by a factor (0.9 = 10% reduction)")]
    Multiply { line_item: String, factor: f64 },

    #[schemars(description = "Add a fixed amount to the line item's computed value")]
    Add { line_item: String, amount: f64 },

    #[schemars(description = "Subtract a fixed amount from the line item's computed value")]
    Reduce { line_item: String, amount: f64 },
}

impl Transformation {
    pub fn target(&self) -> &str {
        match self {
            Transformation::FormulaOverride { line_item, .. }
            | Transformation::Multiply { line_item, .. }
            | Transformation::Add { line_item, .. }
            | Transformation::Reduce { line_item, .. } => line_item,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Transformation::FormulaOverride { .. } => "formula_override",
            Transformation::Multiply { .. } => "multiply",
            Transformation::Add { .. } => "add",
            Transformation::Reduce { .. } => "reduce",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ScenarioAction {
    #[schemars(description = "Unique action code, e.g. 'COST_CUT'")]
    pub action_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub trigger_type: TriggerType,

    #[serde(default = "default_start_period")]
    pub start_period: PeriodId,

    #[serde(default)]
    #[schemars(description = "Last period an UNCONDITIONAL action applies to. None means open-ended.")]
    pub end_period: Option<PeriodId>,

    #[serde(default)]
    #[schemars(
        description = "Boolean expression evaluated against the previous period's values, e.g. 'NET_INCOME <= 250000'"
    )]
    pub trigger_condition: Option<String>,

    #[serde(default)]
    #[schemars(description = "Once a sticky conditional action fires it stays active for the rest of the run")]
    pub trigger_sticky: bool,

    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

fn default_start_period() -> PeriodId {
    1
}

impl ScenarioAction {
    pub fn unconditional(action_code: &str, start_period: PeriodId, end_period: Option<PeriodId>) -> Self {
        Self {
            action_code: action_code.to_string(),
            name: None,
            trigger_type: TriggerType::Unconditional,
            start_period,
            end_period,
            trigger_condition: None,
            trigger_sticky: false,
            transformations: Vec::new(),
        }
    }

    pub fn conditional(action_code: &str, start_period: PeriodId, condition: &str, sticky: bool) -> Self {
        Self {
            action_code: action_code.to_string(),
            name: None,
            trigger_type: TriggerType::Conditional,
            start_period,
            end_period: None,
            trigger_condition: Some(condition.to_string()),
            trigger_sticky: sticky,
            transformations: Vec::new(),
        }
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformations.push(transformation);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct BalanceIdentity {
    #[serde(default = "default_assets_code")]
    pub total_assets: String,
    #[serde(default = "default_liabilities_code")]
    pub total_liabilities: String,
    #[serde(default = "default_equity_code")]
    pub total_equity: String,
}

fn default_assets_code() -> String {
    "TOTAL_ASSETS".to_string()
}

fn default_liabilities_code() -> String {
    "TOTAL_LIABILITIES".to_string()
}

fn default_equity_code() -> String {
    "TOTAL_EQUITY".to_string()
}

impl Default for BalanceIdentity {
    fn default() -> Self {
        Self {
            total_assets: default_assets_code(),
            total_liabilities: default_liabilities_code(),
            total_equity: default_equity_code(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct EngineConfig {
    #[serde(default = "default_balance_identity")]
    #[schemars(description = "Codes checked against Assets = Liabilities + Equity. Null disables the check.")]
    pub balance_identity: Option<BalanceIdentity>,

    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_true")]
    #[schemars(
        description = "Carry every time-shifted code into the next period, not just balance sheet items"
    )]
    pub carry_forward_all_time_shifted: bool,

    #[serde(default = "default_separator")]
    pub variant_code_separator: String,

    #[serde(default = "default_base_currency")]
    #[schemars(description = "ISO currency code that currency-denominated drivers are converted into")]
    pub base_currency: String,
}

fn default_balance_identity() -> Option<BalanceIdentity> {
    Some(BalanceIdentity::default())
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_separator() -> String {
    "__".to_string()
}

fn default_base_currency() -> String {
    "USD".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            balance_identity: default_balance_identity(),
            tolerance: default_tolerance(),
            carry_forward_all_time_shifted: true,
            variant_code_separator: default_separator(),
            base_currency: default_base_currency(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if self.variant_code_separator.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "variant_code_separator must not be empty".to_string(),
            ));
        }
        if self.base_currency.len() != 3 || !self.base_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::InvalidConfiguration(format!(
                "base_currency must be a three-letter currency code, got '{}'",
                self.base_currency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let schema_json = StatementTemplate::schema_as_json().unwrap();
        assert!(schema_json.contains("line_items"));
        assert!(schema_json.contains("validation_rules"));
        assert!(schema_json.contains("formula"));
    }

    #[test]
    fn test_template_from_json() {
        let json = r#"{
            "code": "CORP_UNIFIED_001",
            "line_items": [
                { "code": "REVENUE", "category": "PL" },
                { "code": "COGS", "category": "pl", "base_value_source": "driver:COGS_BASE" },
                { "code": "GROSS_PROFIT", "formula": "REVENUE - COGS", "category": "PL" },
                { "code": "CASH", "formula": "CASH[t-1] + GROSS_PROFIT", "category": "BS" }
            ]
        }"#;

        let template = StatementTemplate::from_json_str(json).unwrap();
        assert_eq!(template.version, 1);
        assert_eq!(template.line_items.len(), 4);
        assert_eq!(template.line_item("COGS").unwrap().provider_key(), "driver:COGS_BASE");
        assert_eq!(template.line_item("REVENUE").unwrap().provider_key(), "REVENUE");
        assert!(template.line_item("CASH").unwrap().is_carry_forward());
        assert!(!template.line_item("GROSS_PROFIT").unwrap().is_carry_forward());
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let template = StatementTemplate::new("DUP")
            .with_line_item(LineItemDefinition::driver("A", StatementCategory::ProfitAndLoss))
            .with_line_item(LineItemDefinition::driver("A", StatementCategory::BalanceSheet));
        assert!(template.validate().is_err());
    }

    #[test]
    fn test_transformation_tagging() {
        let json = r#"[
            { "type": "formula_override", "line_item": "OPEX", "new_formula": "OPEX_BASE * 0.8" },
            { "type": "multiply", "line_item": "REVENUE", "factor": 1.1 },
            { "type": "reduce", "line_item": "COGS", "amount": 500.0 }
        ]"#;
        let parsed: Vec<Transformation> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].target(), "REVENUE");
        assert_eq!(parsed[2].kind_name(), "reduce");
    }

    #[test]
    fn test_adjustments_apply_in_order() {
        let mut item = LineItemDefinition::driver("OPEX", StatementCategory::ProfitAndLoss);
        item.adjustments.push(ValueAdjustment {
            op: AdjustmentOp::Multiply,
            operand: 0.5,
        });
        item.adjustments.push(ValueAdjustment {
            op: AdjustmentOp::Reduce,
            operand: 10.0,
        });
        assert!((item.apply_adjustments(100.0) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_engine_config_defaults_and_validation() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(
            config.balance_identity.as_ref().unwrap().total_assets,
            "TOTAL_ASSETS"
        );

        let disabled = EngineConfig::from_json_str(r#"{ "balance_identity": null }"#).unwrap();
        assert!(disabled.balance_identity.is_none());

        assert!(EngineConfig::from_json_str(r#"{ "tolerance": 0.0 }"#).is_err());

        assert_eq!(config.base_currency, "USD");
        let euro = EngineConfig::from_json_str(r#"{ "base_currency": "EUR" }"#).unwrap();
        assert_eq!(euro.base_currency, "EUR");
        assert!(EngineConfig::from_json_str(r#"{ "base_currency": "EURO" }"#).is_err());
    }
}
