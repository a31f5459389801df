//! Scenario actions: trigger tracking and template variants.
//!
//! A conditional trigger is evaluated against the *previous* period's results,
//! so a condition that first holds in period N takes effect from period N+1.
//! Period 1 has no previous result, so only unconditional actions can be
//! active there.

use crate::error::{EngineError, Result};
use crate::formula::{Formula, VariableRef};
use crate::orchestrator::PeriodResult;
use crate::schema::{
    AdjustmentOp, PeriodId, ScenarioAction, ScenarioId, StatementTemplate, Transformation, TriggerType,
    ValueAdjustment,
};
use crate::storage::{Database, Params, TemplateStore};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parses transformation JSON in either form:
///
/// * array: `[{"type": "multiply", "line_item": "OPEX", "factor": 0.9}]`
/// * object keyed by line item: `{"OPEX": {"type": "multiply", "factor": 0.9}}`
pub fn parse_transformations(json: &str) -> Result<Vec<Transformation>> {
    let value: Value = serde_json::from_str(json)?;
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        Value::Object(map) => {
            let mut transformations = Vec::with_capacity(map.len());
            for (line_item, spec) in map {
                let Value::Object(mut fields) = spec else {
                    return Err(EngineError::InvalidConfiguration(format!(
                        "transformation for '{}' must be an object",
                        line_item
                    )));
                };
                fields
                    .entry("line_item")
                    .or_insert_with(|| Value::String(line_item.clone()));
                transformations.push(serde_json::from_value(Value::Object(fields))?);
            }
            Ok(transformations)
        }
        other => Err(EngineError::InvalidConfiguration(format!(
            "transformations must be an array or object, got {}",
            other
        ))),
    }
}

/// Applies transformations in order and returns how many were applied.
///
/// Targets missing from the template are skipped, as are overrides whose new
/// formula does not parse.
pub fn apply_transformations(template: &mut StatementTemplate, transformations: &[Transformation]) -> usize {
    let mut applied = 0;
    for transformation in transformations {
        let template_code = template.code.clone();
        let Some(item) = template.line_item_mut(transformation.target()) else {
            warn!(
                "Skipping {} on '{}': not defined in template '{}'",
                transformation.kind_name(),
                transformation.target(),
                template_code
            );
            continue;
        };

        match transformation {
            Transformation::FormulaOverride { new_formula, .. } => {
                if let Err(e) = Formula::parse(new_formula) {
                    warn!("Skipping formula_override on '{}': {}", item.code, e);
                    continue;
                }
                item.formula = Some(new_formula.clone());
                item.adjustments.clear();
            }
            Transformation::Multiply { factor, .. } => item.adjustments.push(ValueAdjustment {
                op: AdjustmentOp::Multiply,
                operand: *factor,
            }),
            Transformation::Add { amount, .. } => item.adjustments.push(ValueAdjustment {
                op: AdjustmentOp::Add,
                operand: *amount,
            }),
            Transformation::Reduce { amount, .. } => item.adjustments.push(ValueAdjustment {
                op: AdjustmentOp::Reduce,
                operand: *amount,
            }),
        }
        applied += 1;
    }
    applied
}

/// Applies every action in `active`, in action order. Returns the number of
/// transformations applied.
pub fn apply_actions_to_template(
    template: &mut StatementTemplate,
    actions: &[ScenarioAction],
    active: &BTreeSet<String>,
) -> usize {
    actions
        .iter()
        .filter(|action| active.contains(&action.action_code))
        .map(|action| apply_transformations(template, &action.transformations))
        .sum()
}

/// Produces template variants and persists them through a [`TemplateStore`].
pub struct ActionEngine {
    store: Arc<dyn TemplateStore>,
    separator: String,
}

impl ActionEngine {
    pub fn new(store: Arc<dyn TemplateStore>, separator: &str) -> Self {
        Self {
            store,
            separator: separator.to_string(),
        }
    }

    /// Copies `source_code` to `new_code`, replacing any existing `new_code`.
    pub fn clone_template(&self, source_code: &str, new_code: &str) -> Result<StatementTemplate> {
        let mut template = self.store.load(source_code)?;
        template.code = new_code.to_string();
        template.parent_code = Some(source_code.to_string());
        self.store.save(&template)?;
        debug!("Cloned template '{}' to '{}'", source_code, new_code);
        Ok(template)
    }

    /// `<base>__S<scenario>__<A>+<B>` with action codes sorted.
    pub fn variant_code(&self, base_code: &str, scenario_id: ScenarioId, active: &BTreeSet<String>) -> String {
        let actions: Vec<&str> = active.iter().map(String::as_str).collect();
        format!(
            "{base}{sep}S{scenario}{sep}{actions}",
            base = base_code,
            sep = self.separator,
            scenario = scenario_id,
            actions = actions.join("+")
        )
    }

    /// Clones `base`, applies the active actions and persists the result as
    /// one step. Readers only ever see the finished variant.
    pub fn materialize_variant(
        &self,
        base: &StatementTemplate,
        scenario_id: ScenarioId,
        actions: &[ScenarioAction],
        active: &BTreeSet<String>,
    ) -> Result<StatementTemplate> {
        let mut variant = base.clone();
        variant.code = self.variant_code(&base.code, scenario_id, active);
        variant.parent_code = Some(base.code.clone());

        let applied = apply_actions_to_template(&mut variant, actions, active);
        self.store.save(&variant)?;

        info!(
            "Materialized template variant '{}' ({} transformations applied)",
            variant.code, applied
        );
        Ok(variant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Inactive,
    Active,
}

#[derive(Debug, Clone)]
struct TriggerSlot {
    state: TriggerState,
    ever_activated: bool,
    condition: std::result::Result<Formula, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerUpdate {
    pub active: BTreeSet<String>,
    pub warnings: Vec<String>,
}

/// Per-(scenario, action) trigger state for one run.
#[derive(Debug, Clone)]
pub struct TriggerTracker {
    scenario_id: ScenarioId,
    actions: Vec<ScenarioAction>,
    slots: Vec<TriggerSlot>,
}

impl TriggerTracker {
    pub fn new(scenario_id: ScenarioId, actions: Vec<ScenarioAction>) -> Self {
        let slots = actions
            .iter()
            .map(|action| TriggerSlot {
                state: TriggerState::Inactive,
                ever_activated: false,
                condition: match (&action.trigger_type, &action.trigger_condition) {
                    (TriggerType::Conditional, Some(text)) => Formula::parse(text).map_err(|e| e.to_string()),
                    (TriggerType::Conditional, None) => Err("no trigger_condition given".to_string()),
                    (TriggerType::Unconditional, _) => Err(String::new()),
                },
            })
            .collect();

        Self {
            scenario_id,
            actions,
            slots,
        }
    }

    pub fn actions(&self) -> &[ScenarioAction] {
        &self.actions
    }

    pub fn state(&self, action_code: &str) -> Option<TriggerState> {
        self.position(action_code).map(|i| self.slots[i].state)
    }

    pub fn ever_activated(&self, action_code: &str) -> bool {
        self.position(action_code)
            .is_some_and(|i| self.slots[i].ever_activated)
    }

    fn position(&self, action_code: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.action_code == action_code)
    }

    /// Moves every trigger to its state for `period_id`, given the result of
    /// the period before it.
    pub fn advance(&mut self, period_id: PeriodId, prior: Option<&PeriodResult>) -> TriggerUpdate {
        let mut update = TriggerUpdate::default();

        for (action, slot) in self.actions.iter().zip(self.slots.iter_mut()) {
            let next = match action.trigger_type {
                TriggerType::Unconditional => {
                    let started = period_id >= action.start_period;
                    let ended = action.end_period.is_some_and(|end| period_id > end);
                    if started && !ended {
                        TriggerState::Active
                    } else {
                        TriggerState::Inactive
                    }
                }
                TriggerType::Conditional if action.trigger_sticky && slot.ever_activated => TriggerState::Active,
                TriggerType::Conditional if period_id < action.start_period => TriggerState::Inactive,
                TriggerType::Conditional => match prior {
                    None => TriggerState::Inactive,
                    Some(result) => match evaluate_condition(&slot.condition, result) {
                        Ok(true) => TriggerState::Active,
                        Ok(false) => TriggerState::Inactive,
                        Err(message) => {
                            let warning = format!(
                                "Condition for action '{}' could not be evaluated against period {}: {}",
                                action.action_code, result.period_id, message
                            );
                            warn!("{}", warning);
                            update.warnings.push(warning);
                            TriggerState::Inactive
                        }
                    },
                },
            };

            if next != slot.state {
                debug!(
                    "Scenario {} action '{}': {:?} -> {:?} in period {}",
                    self.scenario_id, action.action_code, slot.state, next, period_id
                );
            }
            if next == TriggerState::Active {
                slot.ever_activated = true;
                update.active.insert(action.action_code.clone());
            }
            slot.state = next;
        }

        update
    }
}

fn evaluate_condition(
    condition: &std::result::Result<Formula, String>,
    prior: &PeriodResult,
) -> std::result::Result<bool, String> {
    let formula = condition.as_ref().map_err(Clone::clone)?;
    let resolver = |var: &VariableRef| -> Result<f64> {
        if var.is_time_shifted() {
            return Err(EngineError::UnknownVariable(var.key()));
        }
        prior
            .values
            .get(&var.name)
            .copied()
            .ok_or_else(|| EngineError::UnknownVariable(var.name.clone()))
    };
    formula
        .evaluate(&resolver)
        .map(|value| value != 0.0)
        .map_err(|e| e.to_string())
}

pub fn load_scenario_actions(db: &dyn Database, scenario_id: ScenarioId) -> Result<Vec<ScenarioAction>> {
    let mut rows = db.execute_query(
        "SELECT action_code, name, trigger_type, start_period, end_period, trigger_condition, trigger_sticky, transformations
         FROM scenario_action WHERE scenario_id = :scenario_id ORDER BY action_code",
        &Params::new().with("scenario_id", scenario_id),
    )?;

    let mut actions = Vec::new();
    while rows.next() {
        let trigger_text = rows.get_string("trigger_type")?;
        let trigger_type = match trigger_text.trim().to_ascii_uppercase().as_str() {
            "UNCONDITIONAL" => TriggerType::Unconditional,
            "CONDITIONAL" => TriggerType::Conditional,
            other => {
                return Err(EngineError::InvalidConfiguration(format!(
                    "unknown trigger_type '{}'",
                    other
                )))
            }
        };

        actions.push(ScenarioAction {
            action_code: rows.get_string("action_code")?,
            name: rows.get_opt_string("name")?,
            trigger_type,
            start_period: rows.get_i32("start_period")?,
            end_period: rows.get_opt_i32("end_period")?,
            trigger_condition: rows.get_opt_string("trigger_condition")?,
            trigger_sticky: rows.get_i64("trigger_sticky")? != 0,
            transformations: parse_transformations(&rows.get_string("transformations")?)?,
        });
    }
    Ok(actions)
}

pub fn save_scenario_action(db: &dyn Database, scenario_id: ScenarioId, action: &ScenarioAction) -> Result<()> {
    let trigger_type = match action.trigger_type {
        TriggerType::Unconditional => "UNCONDITIONAL",
        TriggerType::Conditional => "CONDITIONAL",
    };
    db.execute_update(
        "INSERT OR REPLACE INTO scenario_action
           (scenario_id, action_code, name, trigger_type, start_period, end_period, trigger_condition, trigger_sticky, transformations)
         VALUES (:scenario_id, :action_code, :name, :trigger_type, :start_period, :end_period, :condition, :sticky, :transformations)",
        &Params::new()
            .with("scenario_id", scenario_id)
            .with("action_code", action.action_code.as_str())
            .with("name", action.name.clone())
            .with("trigger_type", trigger_type)
            .with("start_period", action.start_period)
            .with("end_period", action.end_period)
            .with("condition", action.trigger_condition.clone())
            .with("sticky", action.trigger_sticky)
            .with("transformations", serde_json::to_string(&action.transformations)?),
    )?;
    Ok(())
}
