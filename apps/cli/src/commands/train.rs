//! `distill train`: the fine-tuning step loop.

use crate::commands::{print_json, progress_sink};
use crate::services;
use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use distill_training::pipeline::{self, TrainReport};
use distill_training::{DistillConfig, ResumePoint, RunLayout, parse_checkpoint_step};

pub async fn execute(
    mut config: DistillConfig,
    steps: Option<u64>,
    resume_from: Option<String>,
    start_step: Option<u64>,
    json: bool,
) -> Result<()> {
    if let Some(steps) = steps {
        config.training.num_steps = steps;
    }
    config.validate()?;

    let layout = RunLayout::from_config(&config);
    let resume = match resume_from {
        Some(name) => Some(resume_point(&layout, &name, start_step)?),
        None => None,
    };

    let services = services::connect(&config)?;
    let report = pipeline::train(
        services.provider.as_ref(),
        services.tokenizer,
        &config,
        &layout,
        resume,
        progress_sink(json),
    )
    .await?;

    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

/// `latest` picks the periodic checkpoint appended last to the ledger.
fn resume_point(layout: &RunLayout, name: &str, start_step: Option<u64>) -> Result<ResumePoint> {
    if name == "latest" {
        let record = layout.ledger().latest_periodic()?.with_context(|| {
            format!("No periodic checkpoints in {}", layout.ledger_path().display())
        })?;
        return Ok(ResumePoint { checkpoint: record.name, step: start_step.unwrap_or(record.step) });
    }

    let step = start_step
        .or_else(|| parse_checkpoint_step(name))
        .ok_or_else(|| anyhow!("Cannot infer the step of '{}'; pass --start-step", name))?;
    Ok(ResumePoint { checkpoint: name.to_string(), step })
}

pub(crate) fn print_report(report: &TrainReport) {
    let summary = &report.summary;
    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run:               {}", report.run_id.to_string().cyan());
    println!(
        "  Examples:          {} ({} rejected)",
        report.num_examples, report.rejected_examples
    );
    println!("  Steps:             {}", summary.steps_completed);
    if let Some(loss) = summary.final_loss {
        println!("  Final loss:        {:.4}", loss);
    }
    if let Some(mean) = summary.mean_loss_last_10 {
        println!("  Mean loss (last 10): {:.4}", mean);
    }
    println!("  Total time:        {:.1}s", summary.total_seconds);
    println!("  Final checkpoint:  {}", report.final_checkpoint.cyan());
    println!("  Sampler:           {}", report.sampler_model.dimmed());
    println!("  Manifest:          {}", report.manifest_path.display().to_string().dimmed());
    println!();
    println!(
        "  {}",
        format!("Next: distill evaluate --checkpoint {}", report.final_checkpoint).dimmed()
    );
    println!();
}
