use crate::engine::ValueMap;
use crate::error::Result;
use crate::orchestrator::PeriodResult;
use crate::schema::{PeriodId, StatementCategory, StatementTemplate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub code: String,
    pub display_name: String,
    pub value: f64,
}

/// One period's values split into statement views by line-item category.
///
/// Lines keep template order. Codes that were computed but are not defined in
/// the template land in `other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatements {
    pub template_code: String,
    pub period_id: PeriodId,
    pub profit_and_loss: Vec<StatementLine>,
    pub balance_sheet: Vec<StatementLine>,
    pub cash_flow: Vec<StatementLine>,
    pub other: Vec<StatementLine>,
}

impl FinancialStatements {
    pub fn from_values(template: &StatementTemplate, period_id: PeriodId, values: &ValueMap) -> Self {
        let mut statements = Self {
            template_code: template.code.clone(),
            period_id,
            profit_and_loss: Vec::new(),
            balance_sheet: Vec::new(),
            cash_flow: Vec::new(),
            other: Vec::new(),
        };

        for item in &template.line_items {
            let Some(value) = values.get(&item.code) else {
                continue;
            };
            let line = StatementLine {
                code: item.code.clone(),
                display_name: item.display_name.clone().unwrap_or_else(|| item.code.clone()),
                value: *value,
            };
            statements.section_mut(item.category).push(line);
        }

        for (code, value) in values {
            if !template.contains(code) {
                statements.other.push(StatementLine {
                    code: code.clone(),
                    display_name: code.clone(),
                    value: *value,
                });
            }
        }

        statements
    }

    /// `None` for failed periods, which carry no values.
    pub fn from_period(template: &StatementTemplate, period: &PeriodResult) -> Option<Self> {
        period
            .success
            .then(|| Self::from_values(template, period.period_id, &period.values))
    }

    pub fn section(&self, category: StatementCategory) -> &[StatementLine] {
        match category {
            StatementCategory::ProfitAndLoss => &self.profit_and_loss,
            StatementCategory::BalanceSheet => &self.balance_sheet,
            StatementCategory::CashFlow => &self.cash_flow,
            StatementCategory::Other => &self.other,
        }
    }

    fn section_mut(&mut self, category: StatementCategory) -> &mut Vec<StatementLine> {
        match category {
            StatementCategory::ProfitAndLoss => &mut self.profit_and_loss,
            StatementCategory::BalanceSheet => &mut self.balance_sheet,
            StatementCategory::CashFlow => &mut self.cash_flow,
            StatementCategory::Other => &mut self.other,
        }
    }

    pub fn line_count(&self) -> usize {
        self.profit_and_loss.len() + self.balance_sheet.len() + self.cash_flow.len() + self.other.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = format!(
            "# {} - Period {}\n\n",
            self.template_code, self.period_id
        );

        let sections = [
            ("Profit & Loss", &self.profit_and_loss),
            ("Balance Sheet", &self.balance_sheet),
            ("Cash Flow", &self.cash_flow),
            ("Other", &self.other),
        ];

        for (title, lines) in sections {
            if lines.is_empty() {
                continue;
            }
            output.push_str(&format!("## {}\n\n", title));
            output.push_str("| Code | Line Item | Value |\n");
            output.push_str("|------|-----------|------:|\n");
            for line in lines {
                output.push_str(&format!(
                    "| {} | {} | {:.2} |\n",
                    line.code, line.display_name, line.value
                ));
            }
            output.push('\n');
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LineItemDefinition;

    fn template() -> StatementTemplate {
        let mut revenue = LineItemDefinition::driver("REVENUE", StatementCategory::ProfitAndLoss);
        revenue.display_name = Some("Revenue".to_string());
        StatementTemplate::new("SIMPLE")
            .with_line_item(revenue)
            .with_line_item(LineItemDefinition::computed(
                "CASH",
                "CASH[t-1] + REVENUE",
                StatementCategory::BalanceSheet,
            ))
            .with_line_item(LineItemDefinition::computed(
                "CF_NET",
                "REVENUE",
                StatementCategory::CashFlow,
            ))
    }

    fn values() -> ValueMap {
        let mut values = ValueMap::new();
        values.insert("REVENUE".to_string(), 100.0);
        values.insert("CASH".to_string(), 1100.0);
        values.insert("CF_NET".to_string(), 100.0);
        values.insert("EXTRA".to_string(), 1.0);
        values
    }

    #[test]
    fn test_split_by_category() {
        let statements = FinancialStatements::from_values(&template(), 2, &values());

        assert_eq!(statements.profit_and_loss.len(), 1);
        assert_eq!(statements.profit_and_loss[0].display_name, "Revenue");
        assert_eq!(statements.section(StatementCategory::BalanceSheet)[0].code, "CASH");
        assert_eq!(statements.cash_flow.len(), 1);
        assert_eq!(statements.other[0].code, "EXTRA");
        assert_eq!(statements.line_count(), 4);
    }

    #[test]
    fn test_markdown_skips_empty_sections() {
        let mut values = values();
        values.remove("EXTRA");
        let markdown = FinancialStatements::from_values(&template(), 1, &values).to_markdown();

        assert!(markdown.starts_with("# SIMPLE - Period 1"));
        assert!(markdown.contains("| CASH | CASH | 1100.00 |"));
        assert!(!markdown.contains("## Other"));
    }

    #[test]
    fn test_failed_period_has_no_statements() {
        let period = PeriodResult {
            period_id: 3,
            template_code: "SIMPLE".to_string(),
            values: ValueMap::new(),
            active_actions: Vec::new(),
            success: false,
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        assert!(FinancialStatements::from_period(&template(), &period).is_none());
    }
}
