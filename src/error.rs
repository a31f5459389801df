use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of [`EngineError`] used when reporting run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Parse,
    Evaluation,
    DependencyCycle,
    Validation,
    TransactionState,
    NotFound,
    Configuration,
    Cancelled,
    Storage,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Parse error in '{formula}' at position {position}: {message}")]
    Parse {
        formula: String,
        position: usize,
        message: String,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("{function} requires exactly {expected} argument(s), got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("No value available for '{key}' ({context})")]
    MissingValue { key: String, context: String },

    #[error("Expression produced a non-finite result")]
    NonFiniteResult,

    #[error("Time shift of {lag} period(s) from period {period_id} is out of range")]
    TimeShiftOutOfRange { period_id: i32, lag: u64 },

    #[error("Circular dependency detected: {}", codes.join(" -> "))]
    DependencyCycle { codes: Vec<String> },

    #[error("Failed to calculate '{code}': {source}")]
    LineItemFailed {
        code: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Accounting equation violation in period {period_id}: Assets ({assets}) - Liabilities ({liabilities}) - Equity ({equity}) = {difference}")]
    AccountingEquationViolation {
        period_id: i32,
        assets: f64,
        liabilities: f64,
        equity: f64,
        difference: f64,
    },

    #[error("Validation rule '{rule_id}' failed: {message}")]
    ValidationFailed { rule_id: String, message: String },

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unit conversion error: {0}")]
    UnitConversion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Run cancelled before period {period_id}")]
    Cancelled { period_id: i32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Parse { .. } => ErrorKind::Parse,
            EngineError::DivisionByZero
            | EngineError::UnknownVariable(_)
            | EngineError::UnknownFunction(_)
            | EngineError::ArityMismatch { .. }
            | EngineError::MissingValue { .. }
            | EngineError::NonFiniteResult
            | EngineError::TimeShiftOutOfRange { .. }
            | EngineError::UnitConversion(_) => ErrorKind::Evaluation,
            EngineError::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            EngineError::LineItemFailed { source, .. } => source.kind(),
            EngineError::AccountingEquationViolation { .. }
            | EngineError::ValidationFailed { .. } => ErrorKind::Validation,
            EngineError::TransactionState(_) => ErrorKind::TransactionState,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidConfiguration(_) | EngineError::SerializationError(_) => {
                ErrorKind::Configuration
            }
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::Storage(_) | EngineError::Database(_) | EngineError::IoError(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub(crate) fn parse(formula: &str, position: usize, message: impl Into<String>) -> Self {
        EngineError::Parse {
            formula: formula.to_string(),
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_item_failure_reports_source_kind() {
        let err = EngineError::LineItemFailed {
            code: "EBIT".to_string(),
            source: Box::new(EngineError::DivisionByZero),
        };
        assert_eq!(err.kind(), ErrorKind::Evaluation);
        assert!(err.to_string().contains("EBIT"));
    }

    #[test]
    fn test_cycle_message_names_codes() {
        let err = EngineError::DependencyCycle {
            codes: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: A -> B -> A");
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
    }
}
