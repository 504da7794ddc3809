//! `distill prepare`: raw records to train/val conversations.

use crate::commands::print_json;
use anyhow::{Context, Result};
use colored::Colorize;
use distill_training::pipeline::{self, PrepareReport};
use distill_training::{DistillConfig, read_raw_examples};
use std::path::{Path, PathBuf};

pub fn execute(
    mut config: DistillConfig,
    input: &Path,
    out_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    if let Some(dir) = out_dir {
        config.data.train_file = dir.join("train.jsonl");
        config.data.val_file = dir.join("val.jsonl");
    }
    let report = run(&config, input)?;

    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

pub(crate) fn run(config: &DistillConfig, input: &Path) -> Result<PrepareReport> {
    let raw = read_raw_examples(input)
        .with_context(|| format!("Failed to read raw examples from {}", input.display()))?;
    Ok(pipeline::prepare(&raw, config)?)
}

pub(crate) fn print_report(report: &PrepareReport) {
    println!();
    println!("{}", "Data prepared".bold().green());
    println!("  Records:     {}", report.audit.count);
    println!(
        "  Converted:   {} ({} empty, {} too short)",
        report.converted.to_string().cyan(),
        report.skipped_empty,
        report.skipped_too_short
    );
    println!("  Duplicates:  {:.1}%", report.audit.duplicate_rate * 100.0);
    let train_path = report.train_path.display().to_string();
    let val_path = report.val_path.display().to_string();
    println!("  Train:       {} -> {}", report.train_examples, train_path.dimmed());
    println!("  Validation:  {} -> {}", report.val_examples, val_path.dimmed());
    println!("  Dataset id:  {}", report.dataset_id.to_string().dimmed());
    println!();
}
