//! `distill generate`: resumable bulk teacher sampling.

use crate::commands::{print_json, progress_sink};
use crate::services;
use anyhow::{Context, Result};
use colored::Colorize;
use distill_training::{BulkGenerator, DistillConfig, QuestionSource};
use std::path::{Path, PathBuf};
use tracing::warn;

pub async fn execute(
    config: DistillConfig,
    questions: &Path,
    count: usize,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let output = output.unwrap_or_else(|| config.generation.output_file.clone());
    let persona = config.persona()?;
    let source = QuestionSource::from_file(questions, config.generation.question_policy)
        .with_context(|| format!("Failed to read questions from {}", questions.display()))?;
    let items = source.items(count)?;

    let services = services::connect(&config)?;
    let teacher = services.provider.sampling_client(&config.model.teacher_model)?;
    let generator = BulkGenerator::new(
        teacher,
        services.tokenizer,
        &persona,
        &config.metadata.character_name,
        config.generation.sampling(),
    )
    .with_limits(config.generation.concurrency, config.generation.flush_every)
    .with_progress(progress_sink(json));

    let cancel = generator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight requests");
            cancel.cancel();
        }
    });

    let report = generator.run(items, &output).await?;

    if json {
        return print_json(&report);
    }
    println!();
    println!("{}", "Teacher generation finished".bold().green());
    println!("  Requested:     {}", report.requested);
    println!("  Already done:  {}", report.already_done);
    println!("  Completed:     {}", report.completed.to_string().cyan());
    if report.failed > 0 {
        let failed = report.failed.to_string();
        println!("  Failed:        {} {}", failed.red(), "(re-run to retry)".dimmed());
    }
    if report.cancelled {
        println!("  {}", "Cancelled before all items were issued; re-run to resume.".yellow());
    }
    println!("  Output:        {}", output.display().to_string().dimmed());
    println!();
    Ok(())
}
