//! Shared fixtures: a recording test tool and kernels over in-memory traces.
#![allow(dead_code)]

use futures::future::BoxFuture;
use nucleus::internal::{
    config::KernelConfig,
    kernel::Kernel,
    registry::{IntentDeclaration, StaticUnit, UnitManifest, UnitRegistry},
    tools::{
        builtin::builtin_registry,
        registry::ToolRegistry,
        spec::{Tool, ToolDescriptor, ToolError},
    },
    trace::{
        store::MemoryTraceStore,
        trace::{TraceEvent, TraceKind},
    },
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

pub const INTENT_ID: &str = "x.preview";
pub const ROOT: &str = "/tmp/a";

/// Every invocation as `label:dry` or `label:live`, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn live(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_suffix(":live").map(str::to_string))
            .collect()
    }
}

/// Records its `label` input and fails when `fail` is true.
/// `delay_ms` keeps the call open that long.
pub struct Recorder {
    descriptor: ToolDescriptor,
    log: CallLog,
}

impl Recorder {
    pub fn new(descriptor: ToolDescriptor, log: CallLog) -> Self {
        Self {
            descriptor: descriptor
                .inputs(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "label": { "type": "string" },
                        "fail": { "type": "boolean" },
                        "delay_ms": { "type": "integer", "minimum": 0 }
                    },
                    "required": ["path", "label"]
                }))
                .resource_inputs(&["path"]),
            log,
        }
    }
}

impl Tool for Recorder {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn invoke(&self, inputs: Value, dry_run: bool) -> BoxFuture<'_, Result<Value, ToolError>> {
        Box::pin(async move {
            let label = inputs["label"].as_str().unwrap_or_default().to_string();
            let mode = if dry_run { "dry" } else { "live" };
            self.log.0.lock().unwrap().push(format!("{}:{}", label, mode));
            if let Some(ms) = inputs.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
            if inputs.get("fail").and_then(Value::as_bool).unwrap_or(false) {
                return Err(ToolError::Invocation(format!("{} failed on purpose", label)));
            }
            Ok(json!({ "label": label, "dry_run": dry_run }))
        })
    }
}

/// Built-in tools plus `test.record`, destructive `test.wipe` and `test.nodry`.
pub fn tools(log: &CallLog) -> ToolRegistry {
    let mut registry = builtin_registry().unwrap();
    registry
        .register_tool(Recorder::new(ToolDescriptor::new("test.record"), log.clone()))
        .unwrap();
    registry
        .register_tool(Recorder::new(
            ToolDescriptor::new("test.wipe").destructive(true),
            log.clone(),
        ))
        .unwrap();
    registry
        .register_tool(Recorder::new(
            ToolDescriptor::new("test.nodry").dry_run(false),
            log.clone(),
        ))
        .unwrap();
    registry
}

/// A unit that answers `x.preview` with `template`, verbatim.
pub fn units(template: Value) -> UnitRegistry {
    let mut units = UnitRegistry::new();
    units
        .register(Arc::new(StaticUnit::new(
            UnitManifest {
                unit_id: "x".into(),
                version: "1".into(),
                description: None,
                plan: None,
                intents: vec![IntentDeclaration {
                    intent_id: INTENT_ID.into(),
                    summary: None,
                }],
            },
            template,
        )))
        .unwrap();
    units
}

pub struct Fixture {
    pub kernel: Kernel,
    pub store: Arc<MemoryTraceStore>,
    pub log: CallLog,
}

impl Fixture {
    pub fn new(template: Value) -> Self {
        Self::with_config(template, KernelConfig::default())
    }

    pub fn with_config(template: Value, config: KernelConfig) -> Self {
        let log = CallLog::default();
        let store = Arc::new(MemoryTraceStore::new());
        let kernel = Kernel::new(units(template), tools(&log), store.clone(), &config);
        Self { kernel, store, log }
    }

    pub fn events(&self, run_id: &str) -> Vec<TraceEvent> {
        self.store
            .events()
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect()
    }

    pub fn kinds(&self, run_id: &str) -> Vec<TraceKind> {
        self.events(run_id).iter().map(|e| e.kind).collect()
    }
}

pub fn intent() -> Value {
    json!({
        "intent_id": INTENT_ID,
        "params": {},
        "scope": { "fs_roots": [ROOT] }
    })
}

pub fn step(step_id: &str, phase: &str, tool: &str, path: &str) -> Value {
    json!({
        "step_id": step_id,
        "phase": phase,
        "tool": tool,
        "inputs": { "path": path, "label": step_id }
    })
}

pub fn failing(mut step: Value) -> Value {
    step["inputs"]["fail"] = json!(true);
    step
}

pub fn slow(mut step: Value, delay_ms: u64) -> Value {
    step["inputs"]["delay_ms"] = json!(delay_ms);
    step
}

pub fn compensating(mut step: Value, commit_step_id: &str) -> Value {
    step["compensates"] = json!(commit_step_id);
    step
}

pub fn plan(steps: Vec<Value>) -> Value {
    json!({ "steps": steps })
}

pub fn risky_plan(steps: Vec<Value>) -> Value {
    json!({ "risk": "high", "steps": steps })
}
