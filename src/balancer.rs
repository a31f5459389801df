use crate::engine::ValueMap;
use crate::error::{EngineError, Result};
use crate::schema::{BalanceIdentity, EngineConfig, PeriodId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceCheck {
    pub assets: f64,
    pub liabilities: f64,
    pub equity: f64,
}

impl BalanceCheck {
    pub fn difference(&self) -> f64 {
        self.assets - self.liabilities - self.equity
    }
}

/// Checks `assets = liabilities + equity` on a period's computed values.
pub struct AccountingBalancer<'a> {
    identity: &'a BalanceIdentity,
    tolerance: f64,
}

impl<'a> AccountingBalancer<'a> {
    pub fn new(identity: &'a BalanceIdentity, tolerance: f64) -> Self {
        Self {
            identity,
            tolerance,
        }
    }

    /// `None` unless all three identity codes were computed.
    pub fn measure(&self, values: &ValueMap) -> Option<BalanceCheck> {
        Some(BalanceCheck {
            assets: *values.get(&self.identity.total_assets)?,
            liabilities: *values.get(&self.identity.total_liabilities)?,
            equity: *values.get(&self.identity.total_equity)?,
        })
    }

    pub fn verify_accounting_equation(&self, period_id: PeriodId, values: &ValueMap) -> Result<Option<BalanceCheck>> {
        let Some(check) = self.measure(values) else {
            return Ok(None);
        };

        let difference = check.difference();
        if difference.abs() >= self.tolerance {
            return Err(EngineError::AccountingEquationViolation {
                period_id,
                assets: check.assets,
                liabilities: check.liabilities,
                equity: check.equity,
                difference,
            });
        }

        Ok(Some(check))
    }
}

/// Applies the configured identity, if any, to one period.
pub fn verify_accounting_equation(config: &EngineConfig, period_id: PeriodId, values: &ValueMap) -> Result<()> {
    if let Some(identity) = &config.balance_identity {
        AccountingBalancer::new(identity, config.tolerance).verify_accounting_equation(period_id, values)?;
    }
    Ok(())
}
