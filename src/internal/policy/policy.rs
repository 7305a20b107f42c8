use crate::internal::{
    plan::ir::{Phase, Plan, RiskLevel, Step},
    policy::scope::ScopeGuard,
    tools::spec::{SideEffects, ToolDescriptor},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Descriptors of the tools a plan references, keyed by id.
pub type ToolCatalog = BTreeMap<String, ToolDescriptor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Allowed,
    ConfirmationRequired,
    OutOfScope,
    UnknownTool,
    DestructiveDefaultDeny,
    StagingRequired,
    DryRunUnsupported,
    NetworkNotAllowed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Allowed => "ALLOWED",
            ReasonCode::ConfirmationRequired => "CONFIRMATION_REQUIRED",
            ReasonCode::OutOfScope => "OUT_OF_SCOPE",
            ReasonCode::UnknownTool => "UNKNOWN_TOOL",
            ReasonCode::DestructiveDefaultDeny => "DESTRUCTIVE_DEFAULT_DENY",
            ReasonCode::StagingRequired => "STAGING_REQUIRED",
            ReasonCode::DryRunUnsupported => "DRY_RUN_UNSUPPORTED",
            ReasonCode::NetworkNotAllowed => "NETWORK_NOT_ALLOWED",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configurable rules. Scope and unknown-tool checks always run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    DestructiveDefaultDeny,
    StagingRequired,
    DryRunSupported,
    NetworkAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub rules: Vec<Rule>,
    pub require_staging: bool,
    /// Plans at or above this risk wait for confirmation. `None` disables.
    pub confirm_at_risk: Option<RiskLevel>,
    pub confirm_destructive: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                Rule::DestructiveDefaultDeny,
                Rule::StagingRequired,
                Rule::DryRunSupported,
                Rule::NetworkAllowed,
            ],
            require_staging: false,
            confirm_at_risk: Some(RiskLevel::High),
            confirm_destructive: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub allow_destructive: bool,
}

/// Everything a decision may depend on. Nothing else is consulted.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub plan: &'a Plan,
    pub tools: &'a ToolCatalog,
    pub flags: RunFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reason_codes: Vec<ReasonCode>,
    pub summary: String,
}

impl PolicyDecision {
    pub fn allow(code: ReasonCode, summary: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason_codes: vec![code],
            summary: summary.into(),
        }
    }

    pub fn deny(code: ReasonCode, summary: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason_codes: vec![code],
            summary: summary.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }

    pub fn has_reason(&self, code: ReasonCode) -> bool {
        self.reason_codes.contains(&code)
    }
}

/// Outcome of the plan-wide evaluation that precedes any step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDecision {
    pub decision: PolicyDecision,
    /// The first step that failed the pre-flight, on deny.
    pub denied_step: Option<String>,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluates one step. First deny wins.
    pub fn evaluate(&self, step: &Step, ctx: &PlanContext<'_>) -> PolicyDecision {
        let tool = ctx.tools.get(&step.tool);

        let scope = ScopeGuard::check(step, tool, &ctx.plan.scope);
        if !scope.is_allowed() {
            return PolicyDecision::deny(
                ReasonCode::OutOfScope,
                format!(
                    "Step {} targets resources outside scope: {}",
                    step.step_id,
                    scope.violations.join(", ")
                ),
            );
        }

        let Some(tool) = tool else {
            return PolicyDecision::deny(
                ReasonCode::UnknownTool,
                format!("Unknown tool: {}", step.tool),
            );
        };

        for rule in &self.config.rules {
            if let Some(denied) = self.apply(*rule, step, tool, ctx) {
                return denied;
            }
        }

        PolicyDecision::allow(
            ReasonCode::Allowed,
            format!("Step {} allowed ({})", step.step_id, tool.id),
        )
    }

    fn apply(
        &self,
        rule: Rule,
        step: &Step,
        tool: &ToolDescriptor,
        ctx: &PlanContext<'_>,
    ) -> Option<PolicyDecision> {
        match rule {
            Rule::DestructiveDefaultDeny => {
                let allowed = ctx.plan.allow_destructive || ctx.flags.allow_destructive;
                (tool.destructive && !allowed).then(|| {
                    PolicyDecision::deny(
                        ReasonCode::DestructiveDefaultDeny,
                        format!("Destructive tool is denied by default: {}", tool.id),
                    )
                })
            }
            Rule::StagingRequired => (self.config.require_staging
                && step.phase == Phase::Commit
                && !ctx.plan.has_staging())
            .then(|| {
                PolicyDecision::deny(
                    ReasonCode::StagingRequired,
                    format!("Commit step {} requires a staging phase", step.step_id),
                )
            }),
            Rule::DryRunSupported => (ctx.flags.dry_run && !tool.supports_dry_run).then(|| {
                PolicyDecision::deny(
                    ReasonCode::DryRunUnsupported,
                    format!("Tool does not support dry-run: {}", tool.id),
                )
            }),
            Rule::NetworkAllowed => (tool.side_effects == SideEffects::Network
                && !ctx.plan.scope.allow_network)
                .then(|| {
                    PolicyDecision::deny(
                        ReasonCode::NetworkNotAllowed,
                        format!("Network tool {} used without network scope", tool.id),
                    )
                }),
        }
    }

    /// Scope pre-flight over every step, then risk gating.
    pub fn evaluate_plan(&self, ctx: &PlanContext<'_>) -> PlanDecision {
        for step in &ctx.plan.steps {
            let scope = ScopeGuard::check(step, ctx.tools.get(&step.tool), &ctx.plan.scope);
            if !scope.is_allowed() {
                return PlanDecision {
                    decision: PolicyDecision::deny(
                        ReasonCode::OutOfScope,
                        format!(
                            "Step {} targets resources outside scope: {}",
                            step.step_id,
                            scope.violations.join(", ")
                        ),
                    ),
                    denied_step: Some(step.step_id.clone()),
                    requires_confirmation: false,
                };
            }
        }

        let requires_confirmation = !ctx.flags.dry_run && self.is_risk_gated(ctx);
        let decision = if requires_confirmation {
            PolicyDecision::allow(
                ReasonCode::ConfirmationRequired,
                format!("Plan {} requires confirmation before commit", ctx.plan.plan_id),
            )
        } else {
            PolicyDecision::allow(
                ReasonCode::Allowed,
                format!("Plan {} allowed", ctx.plan.plan_id),
            )
        };

        PlanDecision {
            decision,
            denied_step: None,
            requires_confirmation,
        }
    }

    fn is_risk_gated(&self, ctx: &PlanContext<'_>) -> bool {
        let by_risk = self
            .config
            .confirm_at_risk
            .map_or(false, |threshold| ctx.plan.risk >= threshold);
        let by_destructive = self.config.confirm_destructive
            && ctx.plan.steps_in(Phase::Commit).any(|step| {
                ctx.tools
                    .get(&step.tool)
                    .map_or(false, |tool| tool.destructive)
            });
        by_risk || by_destructive
    }
}
