//! Contract validation, unit registry and plan compiler tests

use nucleus::internal::{
    config::KernelConfig,
    contract::validate::{check_contracts, validate, validate_intent, SchemaId, ValidationError},
    plan::{compiler::{CompileError, PlanCompiler}, ir::{Phase, RiskLevel}},
    registry::{UnitRegistry, RegistryError},
    tools::builtin::builtin_registry,
};
use serde_json::json;
use std::{fs, path::Path, sync::Arc};
use tempfile::TempDir;

fn shipped_compiler() -> PlanCompiler {
    let units = UnitRegistry::load_from_dir(Path::new("units")).unwrap();
    PlanCompiler::new(Arc::new(units), Arc::new(builtin_registry().unwrap()))
}

fn archive_intent(root: &str) -> serde_json::Value {
    json!({
        "intent_id": "fs.archive",
        "params": {
            "source": format!("{}/report.txt", root),
            "archive_dir": format!("{}/archive", root),
            "name": "report.txt"
        },
        "scope": { "fs_roots": [root] }
    })
}

#[test]
fn test_embedded_contracts_compile() {
    assert!(check_contracts().is_empty());
    for id in SchemaId::ALL {
        assert_eq!(SchemaId::parse(&format!("{}.schema.json", id)), Some(id));
    }

    println!("Embedded contracts test passed");
}

#[test]
fn test_intent_errors_carry_paths() {
    let err = validate_intent(&json!({
        "intent_id": "",
        "params": {},
        "scope": { "fs_roots": [] },
        "extra": true
    }))
    .unwrap_err();

    let paths = err.paths();
    assert!(paths.contains(&"/intent_id"), "paths: {:?}", paths);
    assert!(paths.contains(&"/scope/fs_roots"), "paths: {:?}", paths);
    assert!(matches!(err, ValidationError::Contract { .. }));
    assert_eq!(err.to_value()["schema"], json!("intent"));

    println!("Intent error path test passed");
}

#[test]
fn test_trace_event_contract_rejects_unknown_kind() {
    let event = json!({
        "run_id": "r",
        "seq": 0,
        "ts": "2024-01-01T00:00:00Z",
        "kind": "step_teleported",
        "payload": {}
    });
    assert!(validate(&event, SchemaId::TraceEvent).is_err());

    println!("Trace event contract test passed");
}

#[test]
fn test_shipped_config_and_units_load() {
    let config = KernelConfig::from_path(Path::new("config/kernel.json")).unwrap();
    assert!(config.policy.require_staging);
    assert_eq!(config.policy.confirm_at_risk, Some(RiskLevel::High));

    let units = UnitRegistry::load_from_dir(&config.units_dir).unwrap();
    let intents: Vec<String> = units.list_intents().into_iter().map(|r| r.intent_id).collect();
    assert_eq!(intents, vec!["fs.archive", "fs.preview"]);

    println!("Shipped config test passed");
}

#[test]
fn test_compile_is_deterministic() {
    let compiler = shipped_compiler();
    let intent = validate_intent(&archive_intent("/tmp/nucleus-arch")).unwrap();

    let first = compiler.compile(&intent).unwrap();
    let second = compiler.compile(&intent).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.plan_id, "plan:fs.archive@1.0.0:fs.archive");
    assert_eq!(first.risk, RiskLevel::Medium);
    assert_eq!(first.steps[2].inputs["to"], json!("/tmp/nucleus-arch/archive/report.txt"));
    let rollback = first.rollback_for("move").unwrap();
    assert_eq!(rollback.phase, Phase::Rollback);

    println!("Deterministic compile test passed");
}

#[test]
fn test_missing_parameter_is_a_unit_error() {
    let compiler = shipped_compiler();
    let intent = validate_intent(&json!({
        "intent_id": "fs.preview",
        "params": {},
        "scope": { "fs_roots": ["/tmp"] }
    }))
    .unwrap();

    let err = compiler.compile(&intent).unwrap_err();
    assert!(matches!(err, CompileError::Unit(_)));
    assert_eq!(err.code(), "compile.unit_error");

    println!("Missing parameter test passed");
}

#[test]
fn test_unknown_intent_is_unroutable() {
    let compiler = shipped_compiler();
    let intent = validate_intent(&json!({
        "intent_id": "mail.send",
        "params": {},
        "scope": { "fs_roots": ["/tmp"] }
    }))
    .unwrap();

    assert!(matches!(
        compiler.compile(&intent),
        Err(CompileError::Unroutable { candidates, .. }) if candidates.is_empty()
    ));

    println!("Unroutable intent test passed");
}

fn write_unit(dir: &Path, name: &str, manifest: serde_json::Value, plan: serde_json::Value) {
    let unit = dir.join(name);
    fs::create_dir_all(&unit).unwrap();
    fs::write(unit.join("manifest.json"), manifest.to_string()).unwrap();
    fs::write(unit.join("plan.json"), plan.to_string()).unwrap();
}

#[test]
fn test_plans_cannot_widen_scope_or_use_unknown_tools() {
    let dir = TempDir::new().unwrap();
    write_unit(
        dir.path(),
        "wide",
        json!({ "unit_id": "wide", "version": "1", "intents": [{ "intent_id": "wide.run" }] }),
        json!({
            "scope": { "fs_roots": ["/"] },
            "steps": [{ "step_id": "s1", "phase": "staging", "tool": "fs.list", "inputs": { "path": "/tmp" } }]
        }),
    );
    write_unit(
        dir.path(),
        "ghost",
        json!({ "unit_id": "ghost", "version": "1", "intents": [{ "intent_id": "ghost.run" }] }),
        json!({
            "steps": [{ "step_id": "s1", "phase": "staging", "tool": "fs.teleport", "inputs": {} }]
        }),
    );
    let units = UnitRegistry::load_from_dir(dir.path()).unwrap();
    let compiler = PlanCompiler::new(Arc::new(units), Arc::new(builtin_registry().unwrap()));

    for intent_id in ["wide.run", "ghost.run"] {
        let intent = validate_intent(&json!({
            "intent_id": intent_id,
            "params": {},
            "scope": { "fs_roots": ["/tmp"] }
        }))
        .unwrap();
        let err = compiler.compile(&intent).unwrap_err();
        assert!(matches!(err, CompileError::MalformedPlan { .. }), "{}: {}", intent_id, err);
    }

    println!("Scope widening test passed");
}

#[test]
fn test_invalid_manifest_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_unit(
        dir.path(),
        "broken",
        json!({ "unit_id": "broken", "version": "1", "intents": [] }),
        json!({ "steps": [] }),
    );

    assert!(matches!(
        UnitRegistry::load_from_dir(dir.path()),
        Err(RegistryError::Validation(_))
    ));

    println!("Invalid manifest test passed");
}
