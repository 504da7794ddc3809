//! `distill metrics`: quality retained and tokens saved.

use crate::commands::print_json;
use anyhow::{Context, Result};
use colored::Colorize;
use distill_training::pipeline::{self, MetricsOutcome};
use distill_training::{DistillConfig, read_evaluation_results};
use std::path::PathBuf;

pub fn execute(
    config: &DistillConfig,
    results: Option<PathBuf>,
    price_per_million: Option<f64>,
    json: bool,
) -> Result<()> {
    let results = results.unwrap_or_else(|| config.evaluation.results_file.clone());
    let records = read_evaluation_results(&results)
        .with_context(|| format!("Failed to read evaluation results from {}", results.display()))?;
    let price = price_per_million.unwrap_or(config.evaluation.price_per_million_tokens);
    let outcome = pipeline::compute_metrics(&records, price, &config.evaluation.report_file)?;

    if json {
        return print_json(&outcome.report);
    }
    print_outcome(&outcome);
    Ok(())
}

pub(crate) fn print_outcome(outcome: &MetricsOutcome) {
    let r = &outcome.report;
    println!();
    println!("{}", "Distillation metrics".bold().cyan());
    println!("  Quality retention:        {}", r.quality_retention.green());
    println!("  Min similarity:           {}", r.min_similarity);
    println!("  Tokens saved per query:   {}", r.tokens_saved_per_query);
    println!("  Token reduction:          {}", r.token_reduction.green());
    println!("  Savings per 1M queries:   {}", r.cost_savings_per_1m_queries);
    println!("  Cost:                     {}", r.cost_multiplier.green());
    println!("  Report: {}", outcome.report_path.display().to_string().dimmed());
    println!();
}
