use crate::engine::ValueMap;
use crate::error::{EngineError, Result};
use crate::orchestrator::RunRequest;
use crate::schema::{PeriodId, ScenarioAction, ScenarioId};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Widest action list accepted for full combination sweeps.
pub const MAX_COMBINATION_ACTIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub scenario_id: ScenarioId,
    pub code: String,
    pub name: String,
    pub description: String,
    pub action_flags: BTreeMap<String, bool>,
}

impl ScenarioConfig {
    pub fn is_action_active(&self, action_code: &str) -> bool {
        self.action_flags.get(action_code).copied().unwrap_or(false)
    }

    /// Builds the run for this scenario from the full action list.
    pub fn to_run_request(
        &self,
        entity_id: &str,
        base_template_code: &str,
        period_ids: Vec<PeriodId>,
        seed: &ValueMap,
        actions: &[ScenarioAction],
    ) -> RunRequest {
        let mut request = RunRequest::new(entity_id, self.scenario_id, base_template_code, period_ids)
            .with_actions(ScenarioGenerator::select_actions(self, actions));
        request.seed = seed.clone();
        request
    }
}

pub struct ScenarioGenerator;

impl ScenarioGenerator {
    /// One scenario per subset of `action_codes`.
    ///
    /// Scenario `base_scenario_id + i` enables action `j` when bit `j` of `i`
    /// is set, so the first scenario is always the no-action baseline.
    pub fn generate_all_combinations(
        action_codes: &[String],
        base_scenario_id: ScenarioId,
        code_prefix: &str,
    ) -> Result<Vec<ScenarioConfig>> {
        if action_codes.len() > MAX_COMBINATION_ACTIONS {
            return Err(EngineError::InvalidConfiguration(format!(
                "{} actions would produce too many combinations (limit {})",
                action_codes.len(),
                MAX_COMBINATION_ACTIONS
            )));
        }

        let total = Self::count_scenarios(action_codes.len());
        let scenarios: Vec<ScenarioConfig> = (0..total)
            .map(|mask| {
                let flags = action_codes
                    .iter()
                    .enumerate()
                    .map(|(j, code)| (code.clone(), mask & (1 << j) != 0))
                    .collect();
                let active: Vec<&str> = action_codes
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| mask & (1 << j) != 0)
                    .map(|(_, code)| code.as_str())
                    .collect();
                Self::config(base_scenario_id + mask as ScenarioId, code_prefix, &active, flags)
            })
            .collect();

        debug!(
            "Generated {} scenario combinations for {} actions",
            scenarios.len(),
            action_codes.len()
        );
        Ok(scenarios)
    }

    /// The baseline followed by one scenario per action with only that action
    /// enabled.
    pub fn generate_single_action_sweep(
        action_codes: &[String],
        base_scenario_id: ScenarioId,
        code_prefix: &str,
    ) -> Vec<ScenarioConfig> {
        let flags_for = |enabled: Option<usize>| -> BTreeMap<String, bool> {
            action_codes
                .iter()
                .enumerate()
                .map(|(j, code)| (code.clone(), enabled == Some(j)))
                .collect()
        };

        let mut scenarios = vec![Self::config(base_scenario_id, code_prefix, &[], flags_for(None))];
        for (i, code) in action_codes.iter().enumerate() {
            scenarios.push(Self::config(
                base_scenario_id + 1 + i as ScenarioId,
                code_prefix,
                &[code.as_str()],
                flags_for(Some(i)),
            ));
        }
        scenarios
    }

    pub fn count_scenarios(action_count: usize) -> usize {
        1usize << action_count
    }

    /// Enabled action codes, in code order.
    pub fn active_actions(config: &ScenarioConfig) -> Vec<String> {
        config
            .action_flags
            .iter()
            .filter(|(_, active)| **active)
            .map(|(code, _)| code.clone())
            .collect()
    }

    /// The subset of `actions` enabled in `config`, keeping input order.
    pub fn select_actions(config: &ScenarioConfig, actions: &[ScenarioAction]) -> Vec<ScenarioAction> {
        actions
            .iter()
            .filter(|action| config.is_action_active(&action.action_code))
            .cloned()
            .collect()
    }

    fn config(
        scenario_id: ScenarioId,
        code_prefix: &str,
        active: &[&str],
        action_flags: BTreeMap<String, bool>,
    ) -> ScenarioConfig {
        let (code, name, description) = if active.is_empty() {
            (
                format!("{}_BASE", code_prefix),
                "Base".to_string(),
                "Base scenario with no actions".to_string(),
            )
        } else {
            let name = active.join("+");
            (
                format!("{}_{}", code_prefix, name.replace(['+', ' '], "_")),
                name,
                format!("Combination: {}", active.join(" + ")),
            )
        };

        ScenarioConfig {
            scenario_id,
            code,
            name,
            description,
            action_flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_combinations_bit_pattern() {
        let scenarios =
            ScenarioGenerator::generate_all_combinations(&codes(&["SOLAR", "FLEET", "LED"]), 10, "PLAN").unwrap();

        assert_eq!(scenarios.len(), 8);
        assert_eq!(scenarios[0].scenario_id, 10);
        assert_eq!(scenarios[0].code, "PLAN_BASE");
        assert_eq!(scenarios[0].name, "Base");
        assert!(ScenarioGenerator::active_actions(&scenarios[0]).is_empty());

        assert_eq!(scenarios[5].scenario_id, 15);
        assert_eq!(scenarios[5].name, "SOLAR+LED");
        assert_eq!(scenarios[5].code, "PLAN_SOLAR_LED");
        assert_eq!(
            ScenarioGenerator::active_actions(&scenarios[5]),
            vec!["LED".to_string(), "SOLAR".to_string()]
        );
        assert_eq!(scenarios[7].action_flags.values().filter(|v| **v).count(), 3);
    }

    #[test]
    fn test_count_and_limit() {
        assert_eq!(ScenarioGenerator::count_scenarios(0), 1);
        assert_eq!(ScenarioGenerator::count_scenarios(4), 16);

        let many: Vec<String> = (0..=MAX_COMBINATION_ACTIONS).map(|i| format!("A{}", i)).collect();
        assert!(ScenarioGenerator::generate_all_combinations(&many, 1, "X").is_err());
    }

    #[test]
    fn test_single_action_sweep() {
        let scenarios = ScenarioGenerator::generate_single_action_sweep(&codes(&["A", "B"]), 1, "S");
        assert_eq!(scenarios.len(), 3);
        assert_eq!(scenarios[2].code, "S_B");
        assert!(scenarios[2].is_action_active("B"));
        assert!(!scenarios[2].is_action_active("A"));
    }

    #[test]
    fn test_select_actions_builds_request() {
        let actions = vec![
            ScenarioAction::unconditional("A", 1, None),
            ScenarioAction::unconditional("B", 2, None),
        ];
        let scenarios = ScenarioGenerator::generate_all_combinations(&codes(&["A", "B"]), 1, "S").unwrap();

        let selected = ScenarioGenerator::select_actions(&scenarios[2], &actions);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].action_code, "B");

        let request = scenarios[3].to_run_request("E1", "BASE", vec![1, 2], &ValueMap::new(), &actions);
        assert_eq!(request.scenario_id, 4);
        assert_eq!(request.actions.len(), 2);
    }
}
