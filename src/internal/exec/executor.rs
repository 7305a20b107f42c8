//! The staging / commit / rollback state machine.
//!
//! One executor call drives one run to a terminal state. Steps run strictly
//! in plan order; every transition is written to the run's trace before the
//! next one happens, and a trace write failure aborts the run.

use crate::internal::{
    plan::ir::{Phase, Plan, Step},
    policy::policy::{PlanContext, PolicyDecision, PolicyEngine, ReasonCode, RunFlags, ToolCatalog},
    tools::{registry::ToolInvoker, spec::ToolError},
    trace::{
        store::RunTrace,
        trace::{TraceError, TraceKind},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{fmt, time::Duration};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Staging,
    AwaitingConfirmation,
    Committing,
    RollingBack,
    Completed,
    RolledBack,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::RolledBack | RunState::Failed
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Staging)
                | (Pending, Failed)
                | (Staging, AwaitingConfirmation)
                | (Staging, Committing)
                | (Staging, Failed)
                | (AwaitingConfirmation, Committing)
                | (AwaitingConfirmation, Failed)
                | (Committing, Completed)
                | (Committing, RollingBack)
                | (Committing, Failed)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }

    /// Moves to `next`. Nothing leaves a terminal state.
    pub fn transition(&mut self, next: RunState) -> Result<(), ExecutionError> {
        if !self.can_transition_to(next) {
            return Err(ExecutionError::InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Staging => "staging",
            RunState::AwaitingConfirmation => "awaiting_confirmation",
            RunState::Committing => "committing",
            RunState::RollingBack => "rolling_back",
            RunState::Completed => "completed",
            RunState::RolledBack => "rolled_back",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// External signals a suspended or running run accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSignal {
    Confirm,
    Reject,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    RolledBack,
    Failed,
}

impl RunOutcome {
    fn state(self) -> RunState {
        match self {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::RolledBack => RunState::RolledBack,
            RunOutcome::Failed => RunState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FailureReason {
    Denied(ReasonCode),
    ToolError,
    ConfirmationTimeout,
    ConfirmationRejected,
    Cancelled,
    RollbackFailed,
    RollbackIncomplete,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Denied(code) => code.as_str(),
            FailureReason::ToolError => "TOOL_ERROR",
            FailureReason::ConfirmationTimeout => "CONFIRMATION_TIMEOUT",
            FailureReason::ConfirmationRejected => "CONFIRMATION_REJECTED",
            FailureReason::Cancelled => "CANCELLED",
            FailureReason::RollbackFailed => "ROLLBACK_FAILED",
            FailureReason::RollbackIncomplete => "ROLLBACK_INCOMPLETE",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<FailureReason> for String {
    fn from(reason: FailureReason) -> Self {
        reason.code().to_string()
    }
}

impl TryFrom<String> for FailureReason {
    type Error = String;

    fn try_from(code: String) -> Result<Self, Self::Error> {
        Ok(match code.as_str() {
            "TOOL_ERROR" => FailureReason::ToolError,
            "CONFIRMATION_TIMEOUT" => FailureReason::ConfirmationTimeout,
            "CONFIRMATION_REJECTED" => FailureReason::ConfirmationRejected,
            "CANCELLED" => FailureReason::Cancelled,
            "ROLLBACK_FAILED" => FailureReason::RollbackFailed,
            "ROLLBACK_INCOMPLETE" => FailureReason::RollbackIncomplete,
            other => FailureReason::Denied(
                serde_json::from_value(Value::String(other.to_string()))
                    .map_err(|_| format!("unknown failure reason: {}", other))?,
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Denied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub phase: Phase,
    pub tool: String,
    pub status: StepStatus,
    pub decision: PolicyDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan_id: String,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub dry_run: bool,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// Step ids that ran to completion in `phase`, in execution order.
    pub fn succeeded(&self, phase: Phase) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.phase == phase && s.status == StepStatus::Succeeded)
            .map(|s| s.step_id.as_str())
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Trace write failed, run aborted: {0}")]
    Trace(#[from] TraceError),
    #[error("Invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Receiving half of a run's signal channel. A run without one can only time out.
#[derive(Debug, Default)]
pub struct RunSignals {
    rx: Option<mpsc::Receiver<RunSignal>>,
}

impl RunSignals {
    pub fn new(rx: mpsc::Receiver<RunSignal>) -> Self {
        Self { rx: Some(rx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    fn try_recv(&mut self) -> Option<RunSignal> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    async fn recv(&mut self) -> RunSignal {
        loop {
            match self.rx.as_mut() {
                Some(rx) => match rx.recv().await {
                    Some(signal) => return signal,
                    None => self.rx = None,
                },
                None => futures::future::pending::<()>().await,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub flags: RunFlags,
    pub confirmation_timeout: Duration,
}

enum StepResult {
    Done,
    Halted(FailureReason),
}

#[derive(Debug, Clone)]
pub struct Executor {
    invoker: ToolInvoker,
    policy: PolicyEngine,
}

impl Executor {
    pub fn new(invoker: ToolInvoker, policy: PolicyEngine) -> Self {
        Self { invoker, policy }
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Descriptors of every tool `plan` references.
    pub fn catalog(&self, plan: &Plan) -> ToolCatalog {
        plan.steps
            .iter()
            .filter_map(|step| self.invoker.registry().get(&step.tool))
            .map(|tool| (tool.id.clone(), tool.clone()))
            .collect()
    }

    pub async fn execute(
        &self,
        plan: &Plan,
        trace: &mut RunTrace,
        options: ExecOptions,
        signals: RunSignals,
    ) -> Result<RunReport, ExecutionError> {
        let catalog = self.catalog(plan);
        let run = Run {
            executor: self,
            plan,
            ctx: PlanContext {
                plan,
                tools: &catalog,
                flags: options.flags,
            },
            trace,
            signals,
            state: RunState::Pending,
            records: Vec::new(),
            committed: Vec::new(),
            confirmed: false,
        };
        run.drive(options.confirmation_timeout).await
    }
}

struct Run<'a> {
    executor: &'a Executor,
    plan: &'a Plan,
    ctx: PlanContext<'a>,
    trace: &'a mut RunTrace,
    signals: RunSignals,
    state: RunState,
    records: Vec<StepRecord>,
    committed: Vec<String>,
    confirmed: bool,
}

impl<'a> Run<'a> {
    fn dry_run(&self) -> bool {
        self.ctx.flags.dry_run
    }

    fn emit(&mut self, kind: TraceKind, payload: Value) -> Result<(), ExecutionError> {
        self.trace.emit(kind, payload)?;
        Ok(())
    }

    async fn drive(mut self, confirmation_timeout: Duration) -> Result<RunReport, ExecutionError> {
        let plan = self.plan;
        let run_id = self.trace.run_id().to_string();
        tracing::info!(run_id = %run_id, plan_id = %plan.plan_id, dry_run = self.dry_run(), "run started");

        self.emit(
            TraceKind::PlanGenerated,
            json!({
                "plan_id": self.plan.plan_id,
                "plan": self.plan,
                "tools": self.ctx.tools,
                "flags": self.ctx.flags,
            }),
        )?;

        let plan_decision = self.executor.policy.evaluate_plan(&self.ctx);
        let mut payload = decision_payload(&plan_decision.decision);
        payload["plan_id"] = json!(self.plan.plan_id);
        payload["requires_confirmation"] = json!(plan_decision.requires_confirmation);
        self.emit(TraceKind::PolicyDecision, payload)?;

        if let Some(step_id) = &plan_decision.denied_step {
            if let Some(step) = plan.step(step_id) {
                self.deny(step, plan_decision.decision.clone())?;
            }
            let code = plan_decision
                .decision
                .reason_codes
                .first()
                .copied()
                .unwrap_or(ReasonCode::OutOfScope);
            return self.finish(RunOutcome::Failed, Some(FailureReason::Denied(code)));
        }

        self.state.transition(RunState::Staging)?;
        let staging: Vec<&Step> = plan.steps_in(Phase::Staging).collect();
        for step in staging {
            if let Some(reason) = self.check_cancelled() {
                return self.finish(RunOutcome::Failed, Some(reason));
            }
            if let StepResult::Halted(reason) = self.run_step(step).await? {
                return self.finish(RunOutcome::Failed, Some(reason));
            }
        }

        let has_commits = self.plan.steps_in(Phase::Commit).next().is_some();
        if plan_decision.requires_confirmation && has_commits {
            self.state.transition(RunState::AwaitingConfirmation)?;
            tracing::info!(run_id = %run_id, "awaiting confirmation");
            if let Some(reason) = self.await_confirmation(confirmation_timeout).await {
                tracing::warn!(run_id = %run_id, reason = %reason, "confirmation not granted");
                return self.finish(RunOutcome::Failed, Some(reason));
            }
        }

        self.state.transition(RunState::Committing)?;
        let commits: Vec<&Step> = plan.steps_in(Phase::Commit).collect();
        for step in commits {
            let halted = match self.check_cancelled() {
                Some(reason) => Some(reason),
                None => match self.run_step(step).await? {
                    StepResult::Done => {
                        if !self.dry_run() {
                            self.committed.push(step.step_id.clone());
                        }
                        None
                    }
                    StepResult::Halted(reason) => Some(reason),
                },
            };
            if let Some(reason) = halted {
                return self.halt_committing(reason).await;
            }
        }

        self.finish(RunOutcome::Completed, None)
    }

    fn check_cancelled(&mut self) -> Option<FailureReason> {
        while let Some(signal) = self.signals.try_recv() {
            match signal {
                RunSignal::Cancel => return Some(FailureReason::Cancelled),
                RunSignal::Confirm => self.confirmed = true,
                // Rejection only means something while awaiting confirmation.
                RunSignal::Reject => {}
            }
        }
        None
    }

    async fn await_confirmation(&mut self, timeout: Duration) -> Option<FailureReason> {
        if self.confirmed {
            return None;
        }
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let signal = tokio::select! {
            _ = &mut deadline => None,
            signal = self.signals.recv() => Some(signal),
        };
        match signal {
            None => Some(FailureReason::ConfirmationTimeout),
            Some(RunSignal::Confirm) => {
                self.confirmed = true;
                None
            }
            Some(RunSignal::Reject) => Some(FailureReason::ConfirmationRejected),
            Some(RunSignal::Cancel) => Some(FailureReason::Cancelled),
        }
    }

    /// Scope guard and policy, then the tool. Records the outcome.
    async fn run_step(&mut self, step: &Step) -> Result<StepResult, ExecutionError> {
        let decision = self.executor.policy.evaluate(step, &self.ctx);
        let mut payload = decision_payload(&decision);
        payload["step_id"] = json!(step.step_id);
        payload["phase"] = json!(step.phase);
        payload["tool"] = json!(step.tool);
        self.emit(TraceKind::PolicyDecision, payload)?;

        if !decision.is_allowed() {
            let code = decision.reason_codes.first().copied().unwrap_or(ReasonCode::OutOfScope);
            self.deny(step, decision)?;
            return Ok(StepResult::Halted(FailureReason::Denied(code)));
        }

        let dry_run = self.dry_run();
        self.emit(
            TraceKind::StepStarted,
            json!({
                "step_id": step.step_id,
                "phase": step.phase,
                "tool": step.tool,
                "dry_run": dry_run,
            }),
        )?;
        tracing::debug!(run_id = %self.trace.run_id(), step_id = %step.step_id, tool = %step.tool, "step started");

        match self.executor.invoker.invoke(&step.tool, &step.inputs, dry_run).await {
            Ok(output) => {
                self.emit(
                    TraceKind::StepFinished,
                    json!({
                        "step_id": step.step_id,
                        "phase": step.phase,
                        "tool": step.tool,
                        "dry_run": dry_run,
                        "output": output.value,
                    }),
                )?;
                self.records.push(StepRecord {
                    step_id: step.step_id.clone(),
                    phase: step.phase,
                    tool: step.tool.clone(),
                    status: StepStatus::Succeeded,
                    decision,
                    output: Some(output.value),
                    error: None,
                });
                Ok(StepResult::Done)
            }
            Err(err) => {
                let kind = if step.phase == Phase::Rollback {
                    "rollback_failure"
                } else {
                    "tool_error"
                };
                self.record_tool_error(step, decision, kind, &err)?;
                Ok(StepResult::Halted(FailureReason::ToolError))
            }
        }
    }

    fn record_tool_error(
        &mut self,
        step: &Step,
        decision: PolicyDecision,
        kind: &str,
        err: &ToolError,
    ) -> Result<(), ExecutionError> {
        tracing::error!(run_id = %self.trace.run_id(), step_id = %step.step_id, error = %err, "{}", kind);
        self.emit(
            TraceKind::Error,
            json!({
                "kind": kind,
                "step_id": step.step_id,
                "phase": step.phase,
                "tool": step.tool,
                "code": err.code(),
                "message": err.to_string(),
            }),
        )?;
        self.records.push(StepRecord {
            step_id: step.step_id.clone(),
            phase: step.phase,
            tool: step.tool.clone(),
            status: StepStatus::Failed,
            decision,
            output: None,
            error: Some(err.to_string()),
        });
        Ok(())
    }

    fn deny(&mut self, step: &Step, decision: PolicyDecision) -> Result<(), ExecutionError> {
        tracing::warn!(
            run_id = %self.trace.run_id(),
            step_id = %step.step_id,
            reasons = ?decision.reason_codes,
            "step denied"
        );
        self.emit(
            TraceKind::StepDenied,
            json!({
                "step_id": step.step_id,
                "phase": step.phase,
                "tool": step.tool,
                "reason_codes": decision.reason_codes,
                "summary": decision.summary,
            }),
        )?;
        self.records.push(StepRecord {
            step_id: step.step_id.clone(),
            phase: step.phase,
            tool: step.tool.clone(),
            status: StepStatus::Denied,
            decision,
            output: None,
            error: None,
        });
        Ok(())
    }

    /// Compensates committed steps in reverse commit order, best effort.
    async fn halt_committing(mut self, reason: FailureReason) -> Result<RunReport, ExecutionError> {
        let plan = self.plan;
        if self.committed.is_empty() || !plan.has_rollback_path() {
            return self.finish(RunOutcome::Failed, Some(reason));
        }

        self.state.transition(RunState::RollingBack)?;
        tracing::warn!(run_id = %self.trace.run_id(), reason = %reason, committed = self.committed.len(), "rolling back");

        let mut missing = false;
        let mut failed = false;
        let committed: Vec<String> = self.committed.iter().rev().cloned().collect();
        for commit_id in committed {
            let Some(rollback) = plan.rollback_for(&commit_id) else {
                tracing::warn!(run_id = %self.trace.run_id(), step_id = %commit_id, "no compensation defined");
                missing = true;
                continue;
            };
            match self.run_step(rollback).await? {
                StepResult::Done => {}
                StepResult::Halted(FailureReason::ToolError) => failed = true,
                StepResult::Halted(_) => missing = true,
            }
        }

        match (failed, missing, reason) {
            (true, _, _) => self.finish(RunOutcome::Failed, Some(FailureReason::RollbackFailed)),
            (false, true, _) => {
                self.finish(RunOutcome::Failed, Some(FailureReason::RollbackIncomplete))
            }
            (false, false, FailureReason::Cancelled) => {
                self.finish(RunOutcome::Failed, Some(FailureReason::Cancelled))
            }
            (false, false, reason) => self.finish(RunOutcome::RolledBack, Some(reason)),
        }
    }

    fn finish(
        mut self,
        outcome: RunOutcome,
        reason: Option<FailureReason>,
    ) -> Result<RunReport, ExecutionError> {
        self.state.transition(outcome.state())?;
        self.emit(
            TraceKind::RunFinished,
            json!({
                "plan_id": self.plan.plan_id,
                "outcome": outcome,
                "reason": reason,
            }),
        )?;

        let run_id = self.trace.run_id().to_string();
        match outcome {
            RunOutcome::Completed => tracing::info!(run_id = %run_id, "run completed"),
            _ => tracing::warn!(run_id = %run_id, outcome = ?outcome, reason = ?reason, "run did not complete"),
        }

        Ok(RunReport {
            run_id,
            plan_id: self.plan.plan_id.clone(),
            outcome,
            reason,
            dry_run: self.ctx.flags.dry_run,
            steps: self.records,
        })
    }
}

/// The wire shape of a decision, ready to carry extra fields.
pub fn decision_payload(decision: &PolicyDecision) -> Value {
    serde_json::to_value(decision).unwrap_or_else(|_| json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RunState::Completed, RunState::RolledBack, RunState::Failed] {
            for next in [RunState::Staging, RunState::Committing, RunState::Failed] {
                let mut state = terminal;
                assert!(state.transition(next).is_err());
                assert_eq!(state, terminal);
            }
        }
    }

    #[test]
    fn confirmation_is_only_entered_from_staging() {
        let mut state = RunState::Pending;
        assert!(state.transition(RunState::AwaitingConfirmation).is_err());
        state.transition(RunState::Staging).unwrap();
        state.transition(RunState::AwaitingConfirmation).unwrap();
        state.transition(RunState::Committing).unwrap();
    }

    #[test]
    fn failure_reasons_serialize_as_codes() {
        let reason = FailureReason::Denied(ReasonCode::OutOfScope);
        assert_eq!(serde_json::to_value(reason).unwrap(), serde_json::json!("OUT_OF_SCOPE"));
        let parsed: FailureReason = serde_json::from_value(serde_json::json!("CONFIRMATION_TIMEOUT")).unwrap();
        assert_eq!(parsed, FailureReason::ConfirmationTimeout);
    }
}
