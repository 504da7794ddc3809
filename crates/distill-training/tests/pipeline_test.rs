//! End-to-end stage tests against the in-process mock service.

use distill_models::{ByteTokenizer, MockProvider};
use distill_training::pipeline::{compute_metrics, evaluate, prepare, train};
use distill_training::{
    CheckpointKind, DistillConfig, NullProgressSink, RawExample, RunLayout, RunManifest,
    read_conversations, read_evaluation_results,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn long_answer(i: usize) -> String {
    format!(
        "Answer {i}: music is a higher revelation than all wisdom and philosophy, and I have \
         carried it through silence, illness and the long winters of Vienna \
         without complaint today."
    )
}

fn write_raw(path: &Path) -> Vec<RawExample> {
    let mut raws: Vec<RawExample> =
        (0..24).map(|i| RawExample::new(format!("Question {i}?"), long_answer(i))).collect();
    raws.extend((0..6).map(|i| RawExample::new(format!("Short {i}?"), "Too brief.")));

    let mut file = std::fs::File::create(path).unwrap();
    for raw in &raws {
        writeln!(file, "{}", serde_json::to_string(raw).unwrap()).unwrap();
    }
    raws
}

fn config_in(root: &Path) -> DistillConfig {
    let persona = root.join("persona.txt");
    std::fs::write(
        &persona,
        "You are Ludwig van Beethoven. Speak with passion about music and hardship.\n",
    )
    .unwrap();

    let mut config = DistillConfig::default();
    config.service.kind = "mock".to_string();
    config.data.train_file = root.join("data/train.jsonl");
    config.data.val_file = root.join("data/val.jsonl");
    config.data.train_ratio = 0.75;
    config.data.max_seq_length = 512;
    config.data.persona_file = Some(persona);
    config.training.num_steps = 12;
    config.checkpointing.save_every = 5;
    config.checkpointing.output_dir = root.join("checkpoints");
    config.logging.log_every = 4;
    config.logging.log_dir = root.join("logs");
    config.evaluation.num_samples = Some(4);
    config.evaluation.max_tokens = 40;
    config.evaluation.results_file = root.join("evaluation_results.json");
    config.evaluation.report_file = root.join("metrics_report.json");
    config
}

#[test]
fn test_prepare_filters_and_splits() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let raws = write_raw(&temp.path().join("raw.jsonl"));

    let report = prepare(&raws, &config).unwrap();
    assert_eq!(report.converted, 24);
    assert_eq!(report.skipped_too_short, 6);
    assert_eq!(report.train_examples, 18);
    assert_eq!(report.val_examples, 6);
    assert_eq!(report.audit.count, 30);

    let train = read_conversations(&config.data.train_file).unwrap();
    assert_eq!(train.len(), 18);
    assert!(train.iter().all(|ex| !ex.question().contains("Beethoven")));

    // Same seed, same input: identical files.
    let first = std::fs::read(&config.data.train_file).unwrap();
    prepare(&raws, &config).unwrap();
    assert_eq!(std::fs::read(&config.data.train_file).unwrap(), first);
}

#[tokio::test]
async fn test_train_evaluate_metrics_on_mock_service() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let raws = write_raw(&temp.path().join("raw.jsonl"));
    prepare(&raws, &config).unwrap();

    let provider = MockProvider::new();
    let tokenizer = Arc::new(ByteTokenizer);
    let layout = RunLayout::from_config(&config);

    let progress = Arc::new(NullProgressSink);
    let trained =
        train(&provider, tokenizer.clone(), &config, &layout, None, progress).await.unwrap();
    assert_eq!(trained.summary.steps_completed, 12);
    assert_eq!(trained.num_examples, 18);
    assert!(trained.final_checkpoint.ends_with("_final_checkpoint"));

    let manifest = RunManifest::read(&trained.manifest_path).unwrap();
    let kinds: Vec<CheckpointKind> = manifest.checkpoints.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CheckpointKind::Periodic,
            CheckpointKind::Periodic,
            CheckpointKind::Final,
            CheckpointKind::Sampler
        ]
    );
    let steps: Vec<u64> = layout.loss_log().read().unwrap().iter().map(|l| l.step).collect();
    assert_eq!(steps, vec![0, 4, 8, 11]);

    let records = evaluate(
        &provider,
        tokenizer,
        &config,
        &trained.final_checkpoint,
        None,
        Arc::new(NullProgressSink),
    )
    .await
    .unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| (0.0..=1.0).contains(&r.similarity)));
    assert!(records.iter().all(|r| r.teacher_token_count > r.student_token_count));
    assert_eq!(read_evaluation_results(&config.evaluation.results_file).unwrap(), records);

    let metrics = compute_metrics(&records, 0.06, &config.evaluation.report_file).unwrap();
    assert!(metrics.summary.tokens_saved_per_query > 0.0);
    assert!(metrics.report.cost_multiplier.ends_with("x cheaper"));
    assert!(config.evaluation.report_file.exists());
}

#[tokio::test]
async fn test_evaluate_unknown_checkpoint_fails() {
    let temp = TempDir::new().unwrap();
    let config = config_in(temp.path());
    let raws = write_raw(&temp.path().join("raw.jsonl"));
    prepare(&raws, &config).unwrap();

    let err = evaluate(
        &MockProvider::new(),
        Arc::new(ByteTokenizer),
        &config,
        "never_saved",
        None,
        Arc::new(NullProgressSink),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("never_saved"));
}
