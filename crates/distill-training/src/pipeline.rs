//! End-to-end stages: prepare, train, evaluate, metrics.
//!
//! Each stage reads its inputs from the paths in [`DistillConfig`] and writes its
//! outputs back to disk, so stages can be run one at a time or chained.

use crate::artifacts::RunManifest;
use crate::audit::{audit, DatasetAudit};
use crate::config::DistillConfig;
use crate::dataset::{
    ConverterOptions, DatasetId, RawExample, compute_dataset_id, convert_all, read_conversations,
    write_conversations,
};
use crate::error::{ServiceContext, TrainingError, TrainingResult};
use crate::evaluator::{write_evaluation_results, EvalModels, EvaluationRecord, Evaluator};
use crate::layout::RunLayout;
use crate::metrics::{summarize, write_report, MetricsReport, MetricsSummary};
use crate::orchestrator::{OrchestratorSettings, TrainingOrchestrator};
use crate::progress::ProgressSink;
use crate::run::{CheckpointNaming, ResumePoint, RunId, RunSummary};
use crate::split::split_dataset;
use crate::tensor::TensorBuilder;
use chrono::Utc;
use distill_abstraction::{ServiceProvider, Tokenizer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub audit: DatasetAudit,
    pub converted: usize,
    pub skipped_empty: usize,
    pub skipped_too_short: usize,
    pub train_examples: usize,
    pub val_examples: usize,
    pub train_path: PathBuf,
    pub val_path: PathBuf,
    pub dataset_id: DatasetId,
}

/// Converts, splits, and writes `data.train_file` / `data.val_file`.
pub fn prepare(raw: &[RawExample], config: &DistillConfig) -> TrainingResult<PrepareReport> {
    let audit = audit(raw);
    audit.log();

    let options = ConverterOptions {
        min_response_words: config.data.min_response_words,
        extraction: config.data.prompt_extraction,
    };
    let conversion = convert_all(raw, &options);
    if conversion.examples.is_empty() {
        return Err(TrainingError::InsufficientData(format!(
            "all {} records were filtered out ({} empty, {} too short)",
            raw.len(),
            conversion.skipped_empty,
            conversion.skipped_too_short
        )));
    }

    let split =
        split_dataset(&conversion.examples, config.data.train_ratio, config.data.seed)?;
    if split.val.is_empty() {
        warn!(examples = conversion.examples.len(), "Validation split is empty");
    }
    write_conversations(&config.data.train_file, &split.train)?;
    write_conversations(&config.data.val_file, &split.val)?;
    let dataset_id = compute_dataset_id(&split.train)?;

    info!(
        train = split.train.len(),
        val = split.val.len(),
        dataset_id = %dataset_id,
        train_path = %config.data.train_file.display(),
        "Prepared training data"
    );

    Ok(PrepareReport {
        audit,
        converted: conversion.examples.len(),
        skipped_empty: conversion.skipped_empty,
        skipped_too_short: conversion.skipped_too_short,
        train_examples: split.train.len(),
        val_examples: split.val.len(),
        train_path: config.data.train_file.clone(),
        val_path: config.data.val_file.clone(),
        dataset_id,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub run_id: RunId,
    pub final_checkpoint: String,
    /// Model id of the sampler bound to the final weights.
    pub sampler_model: String,
    pub num_examples: usize,
    /// Examples dropped by the tensor builder.
    pub rejected_examples: usize,
    pub summary: RunSummary,
    pub manifest_path: PathBuf,
}

/// Trains on `data.train_file` and writes the run manifest.
pub async fn train(
    provider: &dyn ServiceProvider,
    tokenizer: Arc<dyn Tokenizer>,
    config: &DistillConfig,
    layout: &RunLayout,
    resume: Option<ResumePoint>,
    progress: Arc<dyn ProgressSink>,
) -> TrainingResult<TrainReport> {
    let examples = read_conversations(&config.data.train_file)?;
    let builder = TensorBuilder::new(tokenizer, config.data.max_seq_length);
    let tensors = builder.build_all(&examples)?;
    if tensors.tensors.is_empty() {
        return Err(TrainingError::InsufficientData(format!(
            "none of {} examples has a trainable region within {} tokens",
            examples.len(),
            builder.max_length()
        )));
    }
    layout.ensure_dirs()?;

    let session = provider
        .create_training_session(&config.model.base_model, config.model.lora_rank)
        .await
        .context_with(|| format!("creating training session on {}", config.model.base_model))?;

    let naming = CheckpointNaming::new(config.metadata.experiment_name.clone(), RunId::new());
    let run_id = naming.run_id().clone();
    let settings = OrchestratorSettings::from_config(config);
    let orchestrator = TrainingOrchestrator::new(session, settings, naming)
        .with_layout(layout)
        .with_progress(progress);
    let outcome = orchestrator.run(&tensors.tensors, resume).await?;

    let summary = outcome.run.summary();
    let manifest = RunManifest {
        run_id: run_id.clone(),
        experiment: config.metadata.experiment_name.clone(),
        created_at: Utc::now(),
        base_model: config.model.base_model.clone(),
        lora_rank: config.model.lora_rank,
        dataset_id: compute_dataset_id(&examples)?,
        num_examples: tensors.tensors.len(),
        summary: summary.clone(),
        checkpoints: outcome.run.checkpoints.clone(),
    };
    let manifest_path = layout.manifest_path();
    manifest.write(&manifest_path)?;

    Ok(TrainReport {
        run_id,
        final_checkpoint: outcome.final_checkpoint.name,
        sampler_model: outcome.sampler.model_id().to_string(),
        num_examples: tensors.tensors.len(),
        rejected_examples: tensors.rejected,
        summary,
        manifest_path,
    })
}

/// Evaluates `checkpoint` on `data.val_file` and writes `evaluation.results_file`.
pub async fn evaluate(
    provider: &dyn ServiceProvider,
    tokenizer: Arc<dyn Tokenizer>,
    config: &DistillConfig,
    checkpoint: &str,
    num_samples: Option<usize>,
    progress: Arc<dyn ProgressSink>,
) -> TrainingResult<Vec<EvaluationRecord>> {
    let persona = config.persona()?;
    let examples = read_conversations(&config.data.val_file)?;
    if examples.is_empty() {
        return Err(TrainingError::InsufficientData(format!(
            "no held-out examples in {}",
            config.data.val_file.display()
        )));
    }

    let models = EvalModels {
        base_model: config.model.base_model.clone(),
        lora_rank: config.model.lora_rank,
        teacher_model: config.model.teacher_model.clone(),
    };
    let evaluator = Evaluator::from_checkpoint(
        provider,
        &models,
        checkpoint,
        tokenizer,
        persona,
        config.metadata.character_name.clone(),
        config.evaluation.sampling(),
    )
    .await?
    .with_progress(progress);

    let limit = num_samples.or(config.evaluation.num_samples);
    let records = evaluator.evaluate(&examples, limit).await?;
    write_evaluation_results(&config.evaluation.results_file, &records)?;
    info!(
        records = records.len(),
        path = %config.evaluation.results_file.display(),
        "Saved evaluation results"
    );
    Ok(records)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsOutcome {
    pub summary: MetricsSummary,
    pub report: MetricsReport,
    pub report_path: PathBuf,
}

/// Reduces evaluation records and writes `evaluation.report_file`.
pub fn compute_metrics(
    records: &[EvaluationRecord],
    price_per_million_tokens: f64,
    report_path: &Path,
) -> TrainingResult<MetricsOutcome> {
    let summary = summarize(records, price_per_million_tokens)?;
    let report = summary.report();
    write_report(report_path, &report)?;
    info!(
        quality_retention = %report.quality_retention,
        token_reduction = %report.token_reduction,
        cost_multiplier = %report.cost_multiplier,
        "Metrics computed"
    );
    Ok(MetricsOutcome { summary, report, report_path: report_path.to_path_buf() })
}
