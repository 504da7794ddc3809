//! Integration tests for the `distill` binary against the mock service.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fmt::Write as _;
use std::path::Path;
use tempfile::TempDir;

const CONFIG: &str = r#"
[service]
kind = "mock"

[data]
persona_file = "persona.txt"
train_ratio = 0.75
max_seq_length = 512

[training]
num_steps = 6

[checkpointing]
save_every = 3

[logging]
log_every = 2

[evaluation]
num_samples = 3
max_tokens = 40
"#;

fn setup() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    std::fs::write(root.join("distill.toml"), CONFIG).unwrap();
    std::fs::write(root.join("persona.txt"), "You are Ludwig van Beethoven, composer of Vienna.\n")
        .unwrap();
    write_raw(root);
    std::fs::write(root.join("questions.txt"), "What is music?\nWhy Vienna?\n\nWho taught you?\n")
        .unwrap();
    temp
}

fn write_raw(root: &Path) {
    let mut raw = String::new();
    for i in 0..12 {
        let response = format!(
            "Reply {i}: I hear symphonies where others hear only silence, and every bar I write \
             is a fight against fate that I intend to win before the winter ends."
        );
        let record = serde_json::json!({ "prompt": format!("Question {i}?"), "output": response });
        writeln!(raw, "{record}").unwrap();
    }
    writeln!(raw, "{}", serde_json::json!({ "question": "Short?", "response": "Yes." })).unwrap();
    std::fs::write(root.join("raw.jsonl"), raw).unwrap();
}

fn distill(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("distill").unwrap();
    cmd.current_dir(root).arg("--config").arg("distill.toml").arg("--log-level").arg("warn");
    cmd
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("stdout should be JSON")
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("distill")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("prepare"))
        .stdout(predicate::str::contains("generate"))
        .stdout(predicate::str::contains("pipeline"));
}

#[test]
fn test_prepare_json() {
    let temp = setup();
    let args = ["prepare", "--input", "raw.jsonl", "--out-dir", "data", "--json"];
    let json = stdout_json(distill(temp.path()).args(args));

    assert_eq!(json["converted"], 12);
    assert_eq!(json["skipped_too_short"], 1);
    assert_eq!(json["train_examples"], 9);
    assert_eq!(json["val_examples"], 3);
    assert!(temp.path().join("data/train.jsonl").exists());
    assert!(temp.path().join("data/val.jsonl").exists());
}

#[test]
fn test_pipeline_on_mock_service() {
    let temp = setup();
    let json =
        stdout_json(distill(temp.path()).args(["pipeline", "--input", "raw.jsonl", "--json"]));

    assert_eq!(json["train"]["summary"]["steps_completed"], 6);
    assert_eq!(json["evaluated"], 3);
    assert!(json["metrics"]["report"]["quality_retention"].as_str().unwrap().ends_with('%'));

    let root = temp.path();
    assert!(root.join("logs/loss.txt").exists());
    assert!(root.join("checkpoints/checkpoints.jsonl").exists());
    assert!(root.join("checkpoints/run_manifest.json").exists());
    assert!(root.join("evaluation_results.json").exists());
    assert!(root.join("metrics_report.json").exists());

    // The report can be recomputed from the saved results.
    let metrics = stdout_json(distill(root).args(["metrics", "--json"]));
    assert_eq!(metrics["quality_retention"], json["metrics"]["report"]["quality_retention"]);
}

#[test]
fn test_pipeline_without_persona_writes_nothing() {
    let temp = setup();
    let root = temp.path();
    std::fs::remove_file(root.join("persona.txt")).unwrap();

    distill(root)
        .args(["pipeline", "--input", "raw.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("persona"));

    assert!(!root.join("train.jsonl").exists());
    assert!(!root.join("logs/loss.txt").exists());
    assert!(!root.join("checkpoints/run_manifest.json").exists());
}

#[test]
fn test_generate_resumes() {
    let temp = setup();
    let args = ["generate", "--questions", "questions.txt", "--count", "5", "--json"];
    let first = stdout_json(distill(temp.path()).args(args));
    assert_eq!(first["completed"], 5);

    let lines = std::fs::read_to_string(temp.path().join("teacher_data.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 5);

    let second = stdout_json(distill(temp.path()).args(args));
    assert_eq!(second["already_done"], 5);
    assert_eq!(second["issued"], 0);
}

#[test]
fn test_remote_service_without_base_url_fails() {
    let temp = setup();
    std::fs::write(temp.path().join("remote.toml"), "[service]\nkind = \"remote\"\n").unwrap();
    distill(temp.path())
        .args(["prepare", "--input", "raw.jsonl"])
        .assert()
        .success();

    Command::cargo_bin("distill")
        .unwrap()
        .current_dir(temp.path())
        .args(["--config", "remote.toml", "train"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("base_url"));
}

#[test]
fn test_evaluate_unknown_checkpoint_fails() {
    let temp = setup();
    distill(temp.path()).args(["prepare", "--input", "raw.jsonl"]).assert().success();
    distill(temp.path())
        .args(["evaluate", "--checkpoint", "missing_step_10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing_step_10"));
}

#[test]
fn test_metrics_without_results_fails() {
    let temp = setup();
    distill(temp.path())
        .args(["metrics"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("evaluation results"));
}

#[test]
fn test_resume_requires_known_step() {
    let temp = setup();
    distill(temp.path()).args(["prepare", "--input", "raw.jsonl"]).assert().success();
    distill(temp.path())
        .args(["train", "--resume-from", "some_checkpoint"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--start-step"));
}
