//! `distill pipeline`: every stage in one process.

use crate::commands::{evaluate, metrics, prepare, print_json, progress_sink, train};
use crate::services;
use anyhow::{Context, Result};
use distill_training::pipeline::{self, MetricsOutcome, PrepareReport, TrainReport};
use distill_training::{DistillConfig, RunLayout};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct PipelineReport {
    prepare: PrepareReport,
    train: TrainReport,
    evaluated: usize,
    metrics: MetricsOutcome,
}

pub async fn execute(
    mut config: DistillConfig,
    input: &Path,
    steps: Option<u64>,
    json: bool,
) -> Result<()> {
    if let Some(steps) = steps {
        config.training.num_steps = steps;
    }
    config.validate()?;
    // Every startup check runs before any file is written.
    config.persona().context("evaluation needs the persona")?;
    let services = services::connect(&config)?;

    let prepared = prepare::run(&config, input)?;
    if !json {
        prepare::print_report(&prepared);
    }

    let layout = RunLayout::from_config(&config);
    let trained = pipeline::train(
        services.provider.as_ref(),
        services.tokenizer.clone(),
        &config,
        &layout,
        None,
        progress_sink(json),
    )
    .await?;
    if !json {
        train::print_report(&trained);
    }

    let records = pipeline::evaluate(
        services.provider.as_ref(),
        services.tokenizer,
        &config,
        &trained.final_checkpoint,
        None,
        progress_sink(json),
    )
    .await?;
    if !json {
        evaluate::print_records(&records, &config);
    }

    let outcome = pipeline::compute_metrics(
        &records,
        config.evaluation.price_per_million_tokens,
        &config.evaluation.report_file,
    )?;

    if json {
        return print_json(&PipelineReport {
            prepare: prepared,
            train: trained,
            evaluated: records.len(),
            metrics: outcome,
        });
    }
    metrics::print_outcome(&outcome);
    Ok(())
}
