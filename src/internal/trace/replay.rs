//! Reconstructs a run from its trace and checks it: sequence integrity,
//! event ordering, decision determinism and, when a key is supplied,
//! signatures.

use crate::internal::{
    contract::validate::{validate, SchemaId},
    plan::ir::{Phase, Plan},
    policy::policy::{PlanContext, PolicyDecision, PolicyEngine, RunFlags, ToolCatalog},
    trace::trace::{TraceError, TraceEvent, TraceKind},
};
use ed25519_dalek::PublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::Path};

/// Reads a JSONL trace, validating every line against the TraceEvent contract.
pub fn load_trace(path: &Path) -> Result<Vec<TraceEvent>, TraceError> {
    let contents = fs::read_to_string(path)?;
    parse_trace(&contents)
}

pub fn parse_trace(contents: &str) -> Result<Vec<TraceEvent>, TraceError> {
    let mut events = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let invalid = |message: String| TraceError::InvalidEvent {
            line: index + 1,
            message,
        };
        let raw: Value = serde_json::from_str(line).map_err(|e| invalid(e.to_string()))?;
        validate(&raw, SchemaId::TraceEvent).map_err(|e| invalid(e.to_string()))?;
        events.push(serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?);
    }
    Ok(events)
}

/// Distinct run ids in first-seen order.
pub fn run_ids(events: &[TraceEvent]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for event in events {
        if !ids.contains(&event.run_id) {
            ids.push(event.run_id.clone());
        }
    }
    ids
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCheck {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub recorded: PolicyDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed: Option<PolicyDecision>,
    pub matches: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub run_id: String,
    pub events: usize,
    pub seq_gap_free: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decisions: Vec<DecisionCheck>,
    /// Commit steps that finished, in trace order.
    pub commit_order: Vec<String>,
    /// Commit steps whose compensation finished, in trace order.
    pub rollback_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures_verified: Option<usize>,
    pub problems: Vec<String>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn decisions_match(&self) -> bool {
        self.decisions.iter().all(|d| d.matches)
    }
}

/// Replays traces under a given policy configuration.
#[derive(Debug, Clone, Default)]
pub struct Replayer {
    policy: PolicyEngine,
    public_key: Option<PublicKey>,
}

impl Replayer {
    pub fn new(policy: PolicyEngine) -> Self {
        Self {
            policy,
            public_key: None,
        }
    }

    pub fn verify_with(mut self, public_key: PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn replay(&self, events: &[TraceEvent], run_id: &str) -> ReplayReport {
        let mut events: Vec<&TraceEvent> = events.iter().filter(|e| e.run_id == run_id).collect();
        events.sort_by_key(|e| e.seq);

        let mut report = ReplayReport {
            run_id: run_id.to_string(),
            events: events.len(),
            seq_gap_free: events.iter().enumerate().all(|(i, e)| e.seq == i as u64),
            ..ReplayReport::default()
        };

        if events.is_empty() {
            report.problems.push(format!("no events for run {}", run_id));
            return report;
        }
        if !report.seq_gap_free {
            report.problems.push("sequence numbers have gaps or duplicates".to_string());
        }
        if events[0].kind != TraceKind::IntentReceived {
            report
                .problems
                .push(format!("run starts with {} instead of intent_received", events[0].kind));
        }
        self.check_terminal(&events, &mut report);

        let generated = events
            .iter()
            .find(|e| e.kind == TraceKind::PlanGenerated)
            .and_then(|e| match decode_plan(e) {
                Ok(decoded) => Some(decoded),
                Err(message) => {
                    report.problems.push(message);
                    None
                }
            });

        if let Some((plan, tools, flags)) = &generated {
            report.plan_id = Some(plan.plan_id.clone());
            let ctx = PlanContext { plan, tools, flags: *flags };
            self.check_decisions(&events, &ctx, &mut report);
            collect_order(&events, plan, &mut report);
        } else if events.iter().any(|e| e.kind == TraceKind::PolicyDecision) {
            report
                .problems
                .push("policy decisions recorded without a plan_generated event".to_string());
        }

        if let Some(key) = &self.public_key {
            let mut verified = 0;
            for event in &events {
                match event.verify_signature(key) {
                    Ok(true) => verified += 1,
                    Ok(false) => report
                        .problems
                        .push(format!("signature mismatch at seq {}", event.seq)),
                    Err(e) => report.problems.push(format!("seq {}: {}", event.seq, e)),
                }
            }
            report.signatures_verified = Some(verified);
        }

        report
    }

    fn check_terminal(&self, events: &[&TraceEvent], report: &mut ReplayReport) {
        match events.iter().position(|e| e.kind == TraceKind::RunFinished) {
            Some(index) => {
                let finished = events[index];
                report.outcome = finished.payload_str("outcome").map(str::to_string);
                report.reason = finished.payload_str("reason").map(str::to_string);
                if index + 1 != events.len() {
                    report.problems.push(format!(
                        "{} events follow run_finished",
                        events.len() - index - 1
                    ));
                }
            }
            None => {
                let last = events[events.len() - 1];
                if last.kind != TraceKind::Error {
                    report
                        .problems
                        .push("run has no terminal event".to_string());
                }
            }
        }
    }

    fn check_decisions(&self, events: &[&TraceEvent], ctx: &PlanContext<'_>, report: &mut ReplayReport) {
        for event in events.iter().filter(|e| e.kind == TraceKind::PolicyDecision) {
            let recorded: PolicyDecision =
                match serde_json::from_value(Value::Object(event.payload.clone())) {
                    Ok(decision) => decision,
                    Err(e) => {
                        report
                            .problems
                            .push(format!("seq {}: unreadable decision: {}", event.seq, e));
                        continue;
                    }
                };

            let step_id = event.step_id().map(str::to_string);
            let replayed = match &step_id {
                Some(id) => ctx.plan.step(id).map(|step| self.policy.evaluate(step, ctx)),
                None => Some(self.policy.evaluate_plan(ctx).decision),
            };
            let matches = replayed.as_ref() == Some(&recorded);
            if !matches {
                report.problems.push(format!(
                    "decision at seq {} ({}) does not replay",
                    event.seq,
                    step_id.as_deref().unwrap_or("plan")
                ));
            }
            report.decisions.push(DecisionCheck {
                step_id,
                recorded,
                replayed,
                matches,
            });
        }
    }
}

fn decode_plan(event: &TraceEvent) -> Result<(Plan, ToolCatalog, RunFlags), String> {
    let field = |name: &str| {
        event
            .payload
            .get(name)
            .cloned()
            .ok_or_else(|| format!("plan_generated is missing '{}'", name))
    };
    let plan: Plan = serde_json::from_value(field("plan")?).map_err(|e| e.to_string())?;
    let tools: ToolCatalog = serde_json::from_value(field("tools")?).map_err(|e| e.to_string())?;
    let flags: RunFlags = serde_json::from_value(field("flags")?).map_err(|e| e.to_string())?;
    Ok((plan, tools, flags))
}

fn collect_order(events: &[&TraceEvent], plan: &Plan, report: &mut ReplayReport) {
    for event in events.iter().filter(|e| e.kind == TraceKind::StepFinished) {
        let Some(step) = event.step_id().and_then(|id| plan.step(id)) else {
            continue;
        };
        match step.phase {
            Phase::Commit => report.commit_order.push(step.step_id.clone()),
            Phase::Rollback => {
                if let Some(target) = &step.compensates {
                    report.rollback_order.push(target.clone());
                }
            }
            Phase::Staging => {}
        }
    }
}
