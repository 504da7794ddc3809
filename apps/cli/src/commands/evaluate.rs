//! `distill evaluate`: student vs teacher on held-out questions.

use crate::commands::{print_json, progress_sink};
use crate::services;
use anyhow::Result;
use colored::Colorize;
use distill_training::{DistillConfig, EvaluationRecord, pipeline};

pub async fn execute(
    config: DistillConfig,
    checkpoint: &str,
    num_samples: Option<usize>,
    json: bool,
) -> Result<()> {
    let services = services::connect(&config)?;
    let records = pipeline::evaluate(
        services.provider.as_ref(),
        services.tokenizer,
        &config,
        checkpoint,
        num_samples,
        progress_sink(json),
    )
    .await?;

    if json {
        return print_json(&records);
    }
    print_records(&records, &config);
    Ok(())
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(100).collect();
    if text.chars().count() > 100 {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

pub(crate) fn print_records(records: &[EvaluationRecord], config: &DistillConfig) {
    println!();
    println!("{}", format!("Evaluation ({} questions)", records.len()).bold().cyan());
    for (i, r) in records.iter().enumerate() {
        println!();
        println!("  [{}] {}", i + 1, r.question.bold());
        let student = preview(&r.student_response);
        let teacher = preview(&r.teacher_response);
        println!("    student ({} tokens): {}", r.student_token_count, student.dimmed());
        println!("    teacher ({} tokens): {}", r.teacher_token_count, teacher.dimmed());
        println!("    similarity: {:.1}%", r.similarity * 100.0);
    }
    println!();
    println!("  Results: {}", config.evaluation.results_file.display().to_string().dimmed());
    println!();
}
