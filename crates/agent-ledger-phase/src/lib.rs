#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use agent_ledger_domain::{
    ensure_non_empty, hash_bytes, hash_json, CoreError, EvidenceRecord, PhaseState, ToolCategory,
};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const NORMALIZATION_VERSION: u32 = 1;

fn default_back_edge_uses() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseDefinition {
    pub phase_name: String,
    #[serde(default)]
    pub allowed_tools: Vec<ToolCategory>,
    pub call_budget: u32,
    #[serde(default)]
    pub required_outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackEdgeDefinition {
    pub from_phase: String,
    pub to_phase: String,
    #[serde(default = "default_back_edge_uses")]
    pub max_uses: u32,
}

/// Evidence the terminal phase must produce before a task may complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompletionRequirements {
    /// Patterns that must each have fresh passing-test evidence.
    #[serde(default)]
    pub target_patterns: Vec<String>,
    /// Previously-passing baseline that must still pass after the last edit.
    #[serde(default)]
    pub baseline_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhasePlan {
    pub plan_name: String,
    pub plan_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub back_edges: Vec<BackEdgeDefinition>,
    #[serde(default)]
    pub completion: CompletionRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PhasePlanEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub plan: PhasePlan,
    pub normalized_json: Value,
}

/// Load a phase plan YAML from disk and normalize it into canonical form.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or
/// normalized.
pub fn load_plan_from_path(path: &Path) -> Result<PhasePlanEnvelope> {
    let content = fs::read_to_string(path)?;
    normalize_plan_yaml(&content)
}

/// Normalize phase-plan YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_plan_yaml(yaml: &str) -> Result<PhasePlanEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut plan: PhasePlan = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid phase plan YAML structure: {err}"))?;

    validate_plan(&plan)?;
    normalize_plan(&mut plan);
    validate_plan(&plan)?;

    let normalized_json = serde_json::to_value(&plan)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(PhasePlanEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        plan,
        normalized_json,
    })
}

/// Wrap an in-memory plan in the same envelope a YAML load would produce.
///
/// # Errors
/// Returns an error when the plan fails validation or serialization.
pub fn envelope_for_plan(mut plan: PhasePlan) -> Result<PhasePlanEnvelope> {
    validate_plan(&plan)?;
    normalize_plan(&mut plan);
    validate_plan(&plan)?;
    let normalized_json = serde_json::to_value(&plan)?;
    let normalized_hash = hash_json(&normalized_json)?;
    Ok(PhasePlanEnvelope {
        source_format: "builtin".to_string(),
        source_yaml_hash: String::new(),
        normalized_hash,
        plan,
        normalized_json,
    })
}

/// Built-in plan for the structured bug-fix workflow.
#[must_use]
pub fn default_bugfix_plan() -> PhasePlan {
    let phase = |name: &str, tools: &[ToolCategory], budget: u32, outputs: &[&str]| {
        PhaseDefinition {
            phase_name: name.to_string(),
            allowed_tools: tools.to_vec(),
            call_budget: budget,
            required_outputs: outputs.iter().map(ToString::to_string).collect(),
        }
    };
    PhasePlan {
        plan_name: "bugfix".to_string(),
        plan_version: "v1".to_string(),
        normalization_version: NORMALIZATION_VERSION,
        phases: vec![
            phase(
                "localize",
                &[
                    ToolCategory::Read,
                    ToolCategory::Shell,
                    ToolCategory::VersionControl,
                ],
                25,
                &["suspect_files"],
            ),
            phase(
                "understand",
                &[ToolCategory::Read, ToolCategory::Shell],
                20,
                &["root_cause"],
            ),
            phase(
                "fix",
                &[ToolCategory::Read, ToolCategory::Edit, ToolCategory::Shell],
                30,
                &["modified_files"],
            ),
            phase(
                "check_regressions",
                &[ToolCategory::Read, ToolCategory::Shell],
                15,
                &[],
            ),
            phase(
                "verify_target_fix",
                &[ToolCategory::Read, ToolCategory::Shell],
                10,
                &[],
            ),
        ],
        back_edges: vec![BackEdgeDefinition {
            from_phase: "check_regressions".to_string(),
            to_phase: "fix".to_string(),
            max_uses: 1,
        }],
        completion: CompletionRequirements {
            target_patterns: vec!["fail_to_pass".to_string()],
            baseline_patterns: vec!["pass_to_pass".to_string()],
        },
    }
}

fn validate_plan(plan: &PhasePlan) -> Result<()> {
    ensure_non_empty("plan_name", &plan.plan_name)?;
    ensure_non_empty("plan_version", &plan.plan_version)?;
    if plan.phases.is_empty() {
        return Err(anyhow!("plan MUST declare at least one phase"));
    }

    let mut names = BTreeSet::new();
    for phase in &plan.phases {
        ensure_non_empty("phase_name", &phase.phase_name)?;
        if phase.call_budget == 0 {
            return Err(anyhow!(
                "phase {} MUST have a call_budget >= 1",
                phase.phase_name
            ));
        }
        if !names.insert(phase.phase_name.clone()) {
            return Err(anyhow!("duplicate phase_name: {}", phase.phase_name));
        }
    }

    for edge in &plan.back_edges {
        let from = phase_index(plan, &edge.from_phase)
            .ok_or_else(|| anyhow!("back edge references unknown phase {}", edge.from_phase))?;
        let to = phase_index(plan, &edge.to_phase)
            .ok_or_else(|| anyhow!("back edge references unknown phase {}", edge.to_phase))?;
        if to >= from {
            return Err(anyhow!(
                "back edge {} -> {} MUST point to an earlier phase",
                edge.from_phase,
                edge.to_phase
            ));
        }
        if edge.max_uses == 0 {
            return Err(anyhow!(
                "back edge {} -> {} MUST allow at least one use",
                edge.from_phase,
                edge.to_phase
            ));
        }
    }

    for pattern in plan
        .completion
        .target_patterns
        .iter()
        .chain(plan.completion.baseline_patterns.iter())
    {
        ensure_non_empty("completion pattern", pattern)?;
    }

    Ok(())
}

fn normalize_plan(plan: &mut PhasePlan) {
    plan.normalization_version = NORMALIZATION_VERSION;
    for phase in &mut plan.phases {
        phase.allowed_tools.sort();
        phase.allowed_tools.dedup();
        phase.required_outputs.sort();
        phase.required_outputs.dedup();
    }
    plan.back_edges
        .sort_by(|lhs, rhs| (&lhs.from_phase, &lhs.to_phase).cmp(&(&rhs.from_phase, &rhs.to_phase)));
    plan.completion.target_patterns.sort();
    plan.completion.target_patterns.dedup();
    plan.completion.baseline_patterns.sort();
    plan.completion.baseline_patterns.dedup();
}

fn phase_index(plan: &PhasePlan, name: &str) -> Option<usize> {
    plan.phases
        .iter()
        .position(|phase| phase.phase_name == name)
}

/// Outcome of one evidence-gate check, consumed by `PhaseEngine::complete`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionCheck {
    pub pattern: String,
    pub accepted: bool,
}

/// Finite-state machine over a normalized plan. Owns the session's
/// `PhaseState` as a plain value so checkpointing is a clone.
#[derive(Debug, Clone)]
pub struct PhaseEngine {
    plan: PhasePlan,
    state: PhaseState,
}

impl PhaseEngine {
    #[must_use]
    pub fn new(envelope: &PhasePlanEnvelope) -> Self {
        let plan = envelope.plan.clone();
        let state = PhaseState {
            plan_hash: envelope.normalized_hash.clone(),
            current_phase: plan.phases[0].phase_name.clone(),
            calls_used: BTreeMap::new(),
            budget_ceilings: plan
                .phases
                .iter()
                .map(|phase| (phase.phase_name.clone(), phase.call_budget))
                .collect(),
            required_outputs: plan
                .phases
                .iter()
                .map(|phase| (phase.phase_name.clone(), phase.required_outputs.clone()))
                .collect(),
            recorded_outputs: BTreeMap::new(),
            evidence_records: Vec::new(),
            back_edges_taken: BTreeMap::new(),
            archived: false,
        };
        Self { plan, state }
    }

    /// Rebuild an engine from a checkpointed state.
    ///
    /// # Errors
    /// Returns an error when the state was produced by a different plan.
    pub fn from_state(envelope: &PhasePlanEnvelope, state: PhaseState) -> Result<Self> {
        if state.plan_hash != envelope.normalized_hash {
            return Err(anyhow!(
                "phase state belongs to plan {} but engine was built from {}",
                state.plan_hash,
                envelope.normalized_hash
            ));
        }
        if phase_index(&envelope.plan, &state.current_phase).is_none() {
            return Err(anyhow!("unknown phase in state: {}", state.current_phase));
        }
        Ok(Self {
            plan: envelope.plan.clone(),
            state,
        })
    }

    #[must_use]
    pub fn state(&self) -> &PhaseState {
        &self.state
    }

    #[must_use]
    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    #[must_use]
    pub fn current_phase(&self) -> &PhaseDefinition {
        // current_phase is validated on every transition.
        self.plan
            .phases
            .iter()
            .find(|phase| phase.phase_name == self.state.current_phase)
            .unwrap_or(&self.plan.phases[0])
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        phase_index(&self.plan, &self.state.current_phase)
            == Some(self.plan.phases.len() - 1)
    }

    #[must_use]
    pub fn is_tool_allowed(&self, category: ToolCategory) -> bool {
        self.current_phase().allowed_tools.contains(&category)
    }

    /// Admit one tool call in the current phase: allow-list first, then
    /// budget. Rejections happen before any span is opened.
    ///
    /// # Errors
    /// `CoreError::PhaseViolation` for a disallowed category,
    /// `CoreError::BudgetExhausted` when no calls remain.
    pub fn begin_call(&mut self, category: ToolCategory) -> Result<(), CoreError> {
        if self.state.archived {
            return Err(CoreError::Validation(
                "phase state is archived; no further calls".to_string(),
            ));
        }
        let phase = self.state.current_phase.clone();
        if !self.is_tool_allowed(category) {
            return Err(CoreError::PhaseViolation {
                phase,
                tool: category.as_str().to_string(),
            });
        }
        let used = self.state.calls_used_in(&phase);
        let ceiling = self.state.ceiling_for(&phase).unwrap_or(0);
        if used >= ceiling {
            return Err(CoreError::BudgetExhausted {
                phase,
                used,
                ceiling,
            });
        }
        self.state.calls_used.insert(phase, used + 1);
        Ok(())
    }

    /// Record a structured output declared by the agent for the current phase.
    pub fn record_output(&mut self, name: &str, value: Value) {
        self.state.recorded_outputs.insert(name.to_string(), value);
    }

    /// Append evidence extracted from a closed span.
    pub fn push_evidence(&mut self, record: EvidenceRecord) {
        self.state.evidence_records.push(record);
    }

    /// Advance to the next phase, enforcing required outputs.
    ///
    /// # Errors
    /// `CoreError::MissingRequiredOutput` when a required output has no
    /// recorded value; `CoreError::Validation` at the terminal phase.
    pub fn advance(
        &mut self,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<String, CoreError> {
        if self.state.archived {
            return Err(CoreError::Validation(
                "phase state is archived".to_string(),
            ));
        }
        for (name, value) in outputs {
            self.state
                .recorded_outputs
                .insert(name.clone(), value.clone());
        }

        let phase = self.state.current_phase.clone();
        for required in self
            .state
            .required_outputs
            .get(&phase)
            .cloned()
            .unwrap_or_default()
        {
            if !self.state.recorded_outputs.contains_key(&required) {
                return Err(CoreError::MissingRequiredOutput {
                    phase,
                    output: required,
                });
            }
        }

        let Some(index) = phase_index(&self.plan, &phase) else {
            return Err(CoreError::Validation(format!("unknown phase: {phase}")));
        };
        if index + 1 >= self.plan.phases.len() {
            return Err(CoreError::Validation(
                "already at terminal phase; completion requires evidence".to_string(),
            ));
        }
        self.state.current_phase = self.plan.phases[index + 1].phase_name.clone();
        Ok(self.state.current_phase.clone())
    }

    /// Take the declared back-edge out of the current phase (one use per
    /// detected regression). Spent budgets are kept as-is.
    ///
    /// # Errors
    /// `CoreError::Validation` when no back-edge exists or its uses are spent.
    pub fn regress(&mut self) -> Result<String, CoreError> {
        let phase = self.state.current_phase.clone();
        let Some(edge) = self
            .plan
            .back_edges
            .iter()
            .find(|edge| edge.from_phase == phase)
            .cloned()
        else {
            return Err(CoreError::Validation(format!(
                "phase {phase} declares no back edge"
            )));
        };
        let key = format!("{}->{}", edge.from_phase, edge.to_phase);
        let taken = self.state.back_edges_taken.get(&key).copied().unwrap_or(0);
        if taken >= edge.max_uses {
            return Err(CoreError::Validation(format!(
                "back edge {key} already used {taken} time(s)"
            )));
        }
        self.state.back_edges_taken.insert(key, taken + 1);
        self.state.current_phase = edge.to_phase;
        Ok(self.state.current_phase.clone())
    }

    /// Final completion gate. Requires the terminal phase, its required
    /// outputs, and an accepted check for every completion pattern — the
    /// caller computes checks through the evidence gate, never from agent
    /// narration.
    ///
    /// # Errors
    /// `CoreError::Validation` outside the terminal phase or on a missing
    /// check; the first rejected check is surfaced verbatim.
    pub fn complete(&mut self, checks: &[CompletionCheck]) -> Result<(), CoreError> {
        if !self.is_terminal() {
            return Err(CoreError::Validation(format!(
                "completion requested in non-terminal phase {}",
                self.state.current_phase
            )));
        }
        let mut required: BTreeSet<&str> = self
            .plan
            .completion
            .target_patterns
            .iter()
            .chain(self.plan.completion.baseline_patterns.iter())
            .map(String::as_str)
            .collect();
        for check in checks {
            if !check.accepted {
                return Err(CoreError::Validation(format!(
                    "completion check for pattern {} was rejected",
                    check.pattern
                )));
            }
            required.remove(check.pattern.as_str());
        }
        if let Some(missing) = required.into_iter().next() {
            return Err(CoreError::Validation(format!(
                "no completion check provided for pattern {missing}"
            )));
        }
        self.state.archived = true;
        Ok(())
    }
}
