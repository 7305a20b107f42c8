use crate::internal::plan::intent::Scope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// A compiled plan. Immutable once produced; re-planning yields a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub intent_id: String,
    pub unit_id: String,
    pub manifest_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub allow_destructive: bool,
    pub scope: Scope,
    pub steps: Vec<Step>,
}

/// Plan content as returned by a processing unit, before compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub phase: Phase,
    pub tool: String,
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub expected_effects: Vec<ExpectedEffect>,
    /// For rollback steps: the commit step this one reverses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Staging,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedEffect {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Staging => "staging",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        }
    }
}

impl Step {
    pub fn new(step_id: impl Into<String>, phase: Phase, tool: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            title: None,
            phase,
            tool: tool.into(),
            inputs: Map::new(),
            expected_effects: Vec::new(),
            compensates: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_effect(mut self, kind: impl Into<String>, resources: &[&str]) -> Self {
        self.expected_effects.push(ExpectedEffect {
            kind: kind.into(),
            summary: None,
            resources: resources.iter().map(|r| r.to_string()).collect(),
        });
        self
    }

    pub fn compensating(mut self, commit_step_id: impl Into<String>) -> Self {
        self.compensates = Some(commit_step_id.into());
        self
    }

    /// Resources named by the declared effects.
    pub fn declared_resources(&self) -> impl Iterator<Item = &str> {
        self.expected_effects
            .iter()
            .flat_map(|effect| effect.resources.iter().map(String::as_str))
    }
}

impl Plan {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn steps_in(&self, phase: Phase) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.phase == phase)
    }

    pub fn has_staging(&self) -> bool {
        self.steps_in(Phase::Staging).next().is_some()
    }

    /// The rollback step that reverses `commit_step_id`, if the plan defines one.
    pub fn rollback_for(&self, commit_step_id: &str) -> Option<&Step> {
        self.steps_in(Phase::Rollback)
            .find(|s| s.compensates.as_deref() == Some(commit_step_id))
    }

    pub fn has_rollback_path(&self) -> bool {
        self.steps_in(Phase::Rollback).next().is_some()
    }

    pub fn validate(&self, allow_noop: bool) -> Result<(), PlanValidationError> {
        validate_steps(&self.steps, allow_noop)
    }
}

/// Structural checks shared by drafts and compiled plans.
pub fn validate_steps(steps: &[Step], allow_noop: bool) -> Result<(), PlanValidationError> {
    if steps.is_empty() && !allow_noop {
        return Err(PlanValidationError::EmptyPlan);
    }

    let mut seen_ids = HashSet::new();
    for step in steps {
        if !seen_ids.insert(step.step_id.as_str()) {
            return Err(PlanValidationError::DuplicateStepId(step.step_id.clone()));
        }
    }

    // staging* must precede every commit step; rollback steps may sit anywhere
    // after the commit they reverse.
    let mut commit_seen = false;
    let mut commit_positions: HashMap<&str, usize> = HashMap::new();
    let mut compensated: HashSet<&str> = HashSet::new();

    for (index, step) in steps.iter().enumerate() {
        match step.phase {
            Phase::Staging => {
                if commit_seen {
                    return Err(PlanValidationError::StagingAfterCommit(step.step_id.clone()));
                }
                if step.compensates.is_some() {
                    return Err(PlanValidationError::UnexpectedCompensation(step.step_id.clone()));
                }
            }
            Phase::Commit => {
                commit_seen = true;
                commit_positions.insert(step.step_id.as_str(), index);
                if step.compensates.is_some() {
                    return Err(PlanValidationError::UnexpectedCompensation(step.step_id.clone()));
                }
            }
            Phase::Rollback => {
                let target = step
                    .compensates
                    .as_deref()
                    .ok_or_else(|| PlanValidationError::RollbackWithoutTarget(step.step_id.clone()))?;
                match commit_positions.get(target) {
                    Some(position) if *position < index => {}
                    _ => {
                        return Err(PlanValidationError::InvalidRollbackTarget {
                            step_id: step.step_id.clone(),
                            target: target.to_string(),
                        })
                    }
                }
                if !compensated.insert(target) {
                    return Err(PlanValidationError::DuplicateRollback(target.to_string()));
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum PlanValidationError {
    #[error("Plan cannot be empty")]
    EmptyPlan,
    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(String),
    #[error("Staging step {0} appears after a commit step")]
    StagingAfterCommit(String),
    #[error("Rollback step {0} does not name the commit step it reverses")]
    RollbackWithoutTarget(String),
    #[error("Rollback step {step_id} references {target}, which is not an earlier commit step")]
    InvalidRollbackTarget { step_id: String, target: String },
    #[error("Commit step {0} has more than one rollback step")]
    DuplicateRollback(String),
    #[error("Only rollback steps may declare 'compensates' (step {0})")]
    UnexpectedCompensation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, phase: Phase) -> Step {
        Step::new(id, phase, "fs.list").with_input("path", json!("/tmp/a"))
    }

    #[test]
    fn staging_must_precede_commit() {
        let steps = vec![step("c1", Phase::Commit), step("s1", Phase::Staging)];
        assert!(matches!(
            validate_steps(&steps, false),
            Err(PlanValidationError::StagingAfterCommit(id)) if id == "s1"
        ));
    }

    #[test]
    fn rollback_must_follow_its_commit() {
        let early = vec![
            step("r1", Phase::Rollback).compensating("c1"),
            step("c1", Phase::Commit),
        ];
        assert!(matches!(
            validate_steps(&early, false),
            Err(PlanValidationError::InvalidRollbackTarget { .. })
        ));

        let ok = vec![
            step("s1", Phase::Staging),
            step("c1", Phase::Commit),
            step("r1", Phase::Rollback).compensating("c1"),
            step("c2", Phase::Commit),
        ];
        assert!(validate_steps(&ok, false).is_ok());
    }

    #[test]
    fn empty_plan_needs_noop_flag() {
        assert!(matches!(validate_steps(&[], false), Err(PlanValidationError::EmptyPlan)));
        assert!(validate_steps(&[], true).is_ok());
    }
}
