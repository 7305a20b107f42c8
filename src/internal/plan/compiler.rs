use crate::internal::{
    contract::validate::{validate, SchemaId, ValidatedIntent, ValidationError},
    plan::ir::{validate_steps, Plan, PlanDraft, Step},
    policy::scope::scope_within,
    registry::{UnitError, UnitRegistry},
    tools::registry::ToolRegistry,
};
use serde_json::Value;
use std::sync::Arc;

/// Stands in for the unit, intent and version of a plan submitted directly.
pub const ADHOC: &str = "adhoc";

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("No single processing unit handles {intent_id} (candidates: {candidates:?})")]
    Unroutable {
        intent_id: String,
        candidates: Vec<String>,
    },
    #[error("Malformed plan from {unit_id}: {reason}")]
    MalformedPlan { unit_id: String, reason: String },
    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Unroutable { .. } => "compile.unroutable",
            CompileError::MalformedPlan { .. } => "compile.malformed_plan",
            CompileError::Unit(_) => "compile.unit_error",
        }
    }
}

/// Turns validated intents into plans. Holds no state between compilations.
#[derive(Debug, Clone)]
pub struct PlanCompiler {
    units: Arc<UnitRegistry>,
    tools: Arc<ToolRegistry>,
}

impl PlanCompiler {
    pub fn new(units: Arc<UnitRegistry>, tools: Arc<ToolRegistry>) -> Self {
        Self { units, tools }
    }

    pub fn compile(&self, intent: &ValidatedIntent) -> Result<Plan, CompileError> {
        let candidates = self.units.resolve(&intent.intent_id);
        let unit = match candidates.as_slice() {
            [unit] => unit.clone(),
            _ => {
                return Err(CompileError::Unroutable {
                    intent_id: intent.intent_id.clone(),
                    candidates: candidates
                        .iter()
                        .map(|u| u.manifest().unit_id.clone())
                        .collect(),
                })
            }
        };
        let manifest = unit.manifest();
        let malformed = |reason: String| CompileError::MalformedPlan {
            unit_id: manifest.unit_id.clone(),
            reason,
        };

        let draft = unit.plan(intent)?;
        let payload = serde_json::to_value(&draft).map_err(|e| malformed(e.to_string()))?;
        validate(&payload, SchemaId::Plan).map_err(|e: ValidationError| malformed(e.to_string()))?;

        self.check_steps(&draft.steps, intent.flags.allow_noop)
            .map_err(malformed)?;

        let scope = draft.scope.unwrap_or_else(|| intent.scope.clone());
        scope_within(&scope, &intent.scope).map_err(malformed)?;

        let plan = Plan {
            plan_id: draft.plan_id.unwrap_or_else(|| {
                format!(
                    "plan:{}@{}:{}",
                    manifest.unit_id, manifest.version, intent.intent_id
                )
            }),
            intent_id: intent.intent_id.clone(),
            unit_id: manifest.unit_id.clone(),
            manifest_version: manifest.version.clone(),
            summary: draft.summary,
            risk: draft.risk,
            allow_destructive: intent.flags.allow_destructive,
            scope,
            steps: draft.steps,
        };

        tracing::debug!(
            plan_id = %plan.plan_id,
            unit_id = %plan.unit_id,
            steps = plan.steps.len(),
            "plan compiled"
        );
        Ok(plan)
    }

    /// Admits a complete plan submitted without an intent. There is no intent
    /// scope to inherit, so the plan must declare its own, and it can never
    /// allow destructive tools by itself.
    pub fn admit(&self, payload: &Value) -> Result<Plan, CompileError> {
        let identity = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(ADHOC)
                .to_string()
        };
        let unit_id = identity("unit_id");
        let malformed = |reason: String| CompileError::MalformedPlan {
            unit_id: unit_id.clone(),
            reason,
        };

        validate(payload, SchemaId::Plan).map_err(|e| malformed(e.to_string()))?;
        let draft: PlanDraft =
            serde_json::from_value(payload.clone()).map_err(|e| malformed(e.to_string()))?;
        let scope = draft
            .scope
            .ok_or_else(|| malformed("a plan submitted directly must declare its scope".to_string()))?;
        self.check_steps(&draft.steps, false).map_err(malformed)?;

        let intent_id = identity("intent_id");
        let manifest_version = identity("manifest_version");
        let plan = Plan {
            plan_id: draft
                .plan_id
                .unwrap_or_else(|| format!("plan:{}@{}:{}", unit_id, manifest_version, intent_id)),
            intent_id,
            unit_id: unit_id.clone(),
            manifest_version,
            summary: draft.summary,
            risk: draft.risk,
            allow_destructive: false,
            scope,
            steps: draft.steps,
        };

        tracing::debug!(plan_id = %plan.plan_id, steps = plan.steps.len(), "plan admitted");
        Ok(plan)
    }

    fn check_steps(&self, steps: &[Step], allow_noop: bool) -> Result<(), String> {
        validate_steps(steps, allow_noop).map_err(|e| e.to_string())?;
        match steps.iter().find(|step| !self.tools.contains(&step.tool)) {
            Some(step) => Err(format!(
                "step {} uses unregistered tool {}",
                step.step_id, step.tool
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::{
        contract::validate::validate_intent,
        registry::{IntentDeclaration, StaticUnit, UnitManifest},
        tools::builtin::builtin_registry,
    };
    use serde_json::{json, Value};

    fn compiler(template: Value) -> PlanCompiler {
        let mut units = UnitRegistry::new();
        units
            .register(Arc::new(StaticUnit::new(
                UnitManifest {
                    unit_id: "fs".into(),
                    version: "3".into(),
                    description: None,
                    plan: None,
                    intents: vec![IntentDeclaration { intent_id: "fs.preview".into(), summary: None }],
                },
                template,
            )))
            .unwrap();
        PlanCompiler::new(Arc::new(units), Arc::new(builtin_registry().unwrap()))
    }

    fn intent(intent_id: &str) -> ValidatedIntent {
        validate_intent(&json!({
            "intent_id": intent_id,
            "params": {},
            "scope": {"fs_roots": ["/tmp/a"]}
        }))
        .unwrap()
    }

    #[test]
    fn unknown_intent_is_unroutable() {
        let c = compiler(json!({"steps": []}));
        assert!(matches!(
            c.compile(&intent("other.preview")),
            Err(CompileError::Unroutable { .. })
        ));
    }

    #[test]
    fn compile_is_deterministic_and_names_the_plan() {
        let c = compiler(json!({"steps": [
            {"step_id": "s1", "phase": "staging", "tool": "fs.list", "inputs": {"path": "/tmp/a"}}
        ]}));
        let a = c.compile(&intent("fs.preview")).unwrap();
        let b = c.compile(&intent("fs.preview")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.plan_id, "plan:fs@3:fs.preview");
        assert_eq!(a.scope.fs_roots, vec!["/tmp/a".to_string()]);
    }

    #[test]
    fn widened_plan_scope_is_malformed() {
        let c = compiler(json!({
            "scope": {"fs_roots": ["/"]},
            "steps": [{"step_id": "s1", "phase": "staging", "tool": "fs.list", "inputs": {"path": "/tmp/a"}}]
        }));
        assert!(matches!(
            c.compile(&intent("fs.preview")),
            Err(CompileError::MalformedPlan { .. })
        ));
    }

    #[test]
    fn unregistered_tool_is_malformed() {
        let c = compiler(json!({"steps": [
            {"step_id": "s1", "phase": "staging", "tool": "fs.shred", "inputs": {}}
        ]}));
        let err = c.compile(&intent("fs.preview")).unwrap_err();
        assert!(err.to_string().contains("fs.shred"));
    }

    #[test]
    fn admitted_plan_needs_its_own_scope() {
        let c = compiler(json!({"steps": []}));
        let steps = json!([
            {"step_id": "s1", "phase": "staging", "tool": "fs.list", "inputs": {"path": "/tmp/a"}}
        ]);

        let err = c.admit(&json!({ "steps": steps })).unwrap_err();
        assert!(err.to_string().contains("scope"));

        let plan = c
            .admit(&json!({
                "allow_destructive": true,
                "scope": {"fs_roots": ["/tmp/a"]},
                "steps": steps
            }))
            .unwrap();
        assert_eq!(plan.plan_id, "plan:adhoc@adhoc:adhoc");
        assert!(!plan.allow_destructive);

        assert!(matches!(
            c.admit(&json!({ "scope": {"fs_roots": ["/tmp/a"]}, "steps": [], "extra": 1 })),
            Err(CompileError::MalformedPlan { .. })
        ));
    }
}
