//! End-to-end runs of the shipped units against a real temporary directory.

use nucleus::internal::{
    config::KernelConfig,
    exec::executor::{FailureReason, RunOutcome},
    kernel::{Kernel, RunOptions},
    policy::policy::ReasonCode,
    registry::UnitRegistry,
    tools::builtin::builtin_registry,
    trace::{replay::Replayer, store::MemoryTraceStore, trace::TraceKind},
};
use serde_json::{json, Value};
use std::{fs, path::Path, sync::Arc};
use tempfile::TempDir;

fn kernel() -> (Kernel, Arc<MemoryTraceStore>) {
    let config = KernelConfig::from_path(Path::new("config/kernel.json")).unwrap();
    let store = Arc::new(MemoryTraceStore::new());
    let kernel = Kernel::new(
        UnitRegistry::load_from_dir(&config.units_dir).unwrap(),
        builtin_registry().unwrap(),
        store.clone(),
        &config,
    );
    (kernel, store)
}

fn archive_intent(root: &Path) -> Value {
    let root = root.to_string_lossy();
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

#[tokio::test]
async fn test_archive_moves_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("report.txt"), "q3").unwrap();
    let (kernel, store) = kernel();

    let report = kernel
        .run(archive_intent(dir.path()), RunOptions::default().with_run_id("archive"))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed, "{:?}", report);
    assert!(!dir.path().join("report.txt").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("archive").join("report.txt")).unwrap(),
        "q3"
    );

    let replay = Replayer::default().replay(&store.events(), "archive");
    assert_eq!(replay.commit_order, vec!["prepare", "move"]);

    println!("Archive end-to-end test passed");
}

#[tokio::test]
async fn test_repeated_dry_runs_leave_disk_untouched() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("report.txt"), "q3").unwrap();
    let (kernel, _) = kernel();

    for _ in 0..3 {
        let report = kernel
            .run(archive_intent(dir.path()), RunOptions::dry_run())
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        let moved = report.steps.iter().find(|s| s.step_id == "move").unwrap();
        assert_eq!(moved.output.as_ref().unwrap()["dry_run"], json!(true));
    }

    assert!(dir.path().join("report.txt").exists());
    assert!(!dir.path().join("archive").exists());

    println!("Dry-run idempotence test passed");
}

#[tokio::test]
async fn test_missing_source_fails_in_staging() {
    let dir = TempDir::new().unwrap();
    let (kernel, store) = kernel();

    let report = kernel
        .run(archive_intent(dir.path()), RunOptions::default().with_run_id("missing"))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.reason, Some(FailureReason::ToolError));
    assert!(!dir.path().join("archive").exists());
    assert!(store
        .events()
        .iter()
        .any(|e| e.kind == TraceKind::Error && e.step_id() == Some("inspect")));

    println!("Staging failure test passed");
}

#[tokio::test]
async fn test_blocked_move_is_rolled_back() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("report.txt"), "new").unwrap();
    fs::create_dir_all(dir.path().join("archive")).unwrap();
    fs::write(dir.path().join("archive").join("report.txt"), "old").unwrap();
    let (kernel, _) = kernel();

    let report = kernel
        .run(archive_intent(dir.path()), RunOptions::default())
        .await
        .unwrap();

    // `move` never committed, and `prepare` has no compensation.
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.reason, Some(FailureReason::RollbackIncomplete));
    assert_eq!(fs::read_to_string(dir.path().join("report.txt")).unwrap(), "new");
    assert_eq!(
        fs::read_to_string(dir.path().join("archive").join("report.txt")).unwrap(),
        "old"
    );

    println!("Blocked move test passed");
}

#[tokio::test]
async fn test_dry_run_reports_blocked_move() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("report.txt"), "new").unwrap();
    fs::create_dir_all(dir.path().join("archive")).unwrap();
    fs::write(dir.path().join("archive").join("report.txt"), "old").unwrap();
    let (kernel, _) = kernel();

    let report = kernel
        .run(archive_intent(dir.path()), RunOptions::dry_run())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.reason, Some(FailureReason::ToolError));
    let moved = report.steps.iter().find(|s| s.step_id == "move").unwrap();
    assert!(moved.error.as_deref().unwrap_or("").contains("destination exists"));
    assert_eq!(fs::read_to_string(dir.path().join("report.txt")).unwrap(), "new");

    println!("Dry-run conflict test passed");
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_out_of_root_is_denied() {
    let dir = TempDir::new().unwrap();
    let inside = dir.path().join("in");
    let outside = dir.path().join("out");
    fs::create_dir_all(&inside).unwrap();
    fs::create_dir_all(&outside).unwrap();
    fs::write(inside.join("report.txt"), "q3").unwrap();
    std::os::unix::fs::symlink(&outside, inside.join("link")).unwrap();
    let (kernel, store) = kernel();

    let root = inside.to_string_lossy();
    let intent = json!({
        "intent_id": "fs.archive",
        "params": {
            "source": format!("{}/report.txt", root),
            "archive_dir": format!("{}/link", root),
            "name": "report.txt"
        },
        "scope": { "fs_roots": [root] }
    });
    let report = kernel
        .run(intent, RunOptions::default().with_run_id("escape"))
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.reason, Some(FailureReason::Denied(ReasonCode::OutOfScope)));
    assert!(inside.join("report.txt").exists());
    assert!(!outside.join("report.txt").exists());
    assert!(!store
        .events()
        .iter()
        .any(|e| e.kind == TraceKind::StepStarted));

    println!("Symlink escape test passed");
}

#[tokio::test]
async fn test_preview_reports_every_decision() {
    let dir = TempDir::new().unwrap();
    let (kernel, store) = kernel();

    let preview = kernel
        .preview(&archive_intent(dir.path()), &RunOptions::default())
        .unwrap();

    assert!(!preview.requires_confirmation);
    assert_eq!(preview.steps.len(), 4);
    assert!(preview.steps.iter().all(|s| s.decision.is_allowed()));
    assert!(store.events().is_empty());

    println!("Preview test passed");
}
