use crate::error::{TrainingError, TrainingResult};
use crate::evaluator::EvaluationRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Aggregate quality and cost figures over a set of evaluation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub num_records: usize,
    pub mean_similarity: f64,
    pub min_similarity: f64,
    pub mean_teacher_tokens: f64,
    pub mean_student_tokens: f64,
    /// Teacher minus student prompt tokens, per query.
    pub tokens_saved_per_query: f64,
    /// Percentage of teacher prompt tokens removed, 0..=100.
    pub token_reduction_pct: f64,
    /// Dollars saved over one million queries.
    pub cost_savings_per_1m_queries: f64,
    /// Teacher prompt cost divided by student prompt cost.
    pub cost_multiplier: f64,
}

/// Human-readable report persisted as `metrics_report.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub quality_retention: String,
    pub min_similarity: String,
    pub tokens_saved_per_query: i64,
    pub token_reduction: String,
    pub cost_savings_per_1m_queries: String,
    pub cost_multiplier: String,
}

/// Reduces records to a summary. `price_per_million_tokens` is the prompt price in dollars.
pub fn summarize(
    records: &[EvaluationRecord],
    price_per_million_tokens: f64,
) -> TrainingResult<MetricsSummary> {
    if records.is_empty() {
        return Err(TrainingError::InsufficientData("no data".to_string()));
    }

    let n = records.len() as f64;
    let mean_similarity = records.iter().map(|r| r.similarity).sum::<f64>() / n;
    let min_similarity = records.iter().map(|r| r.similarity).fold(f64::INFINITY, f64::min);
    let mean_teacher_tokens = records.iter().map(|r| r.teacher_token_count as f64).sum::<f64>() / n;
    let mean_student_tokens = records.iter().map(|r| r.student_token_count as f64).sum::<f64>() / n;

    let tokens_saved_per_query = mean_teacher_tokens - mean_student_tokens;
    let token_reduction_pct = if mean_teacher_tokens > 0.0 {
        tokens_saved_per_query / mean_teacher_tokens * 100.0
    } else {
        0.0
    };
    // A million queries each saving `tokens_saved_per_query` tokens.
    let cost_savings_per_1m_queries = tokens_saved_per_query * price_per_million_tokens;
    let cost_multiplier = if mean_student_tokens > 0.0 {
        mean_teacher_tokens / mean_student_tokens
    } else {
        f64::INFINITY
    };

    Ok(MetricsSummary {
        num_records: records.len(),
        mean_similarity,
        min_similarity,
        mean_teacher_tokens,
        mean_student_tokens,
        tokens_saved_per_query,
        token_reduction_pct,
        cost_savings_per_1m_queries,
        cost_multiplier,
    })
}

impl MetricsSummary {
    #[must_use]
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            quality_retention: format!("{:.1}%", self.mean_similarity * 100.0),
            min_similarity: format!("{:.1}%", self.min_similarity * 100.0),
            tokens_saved_per_query: self.tokens_saved_per_query.round() as i64,
            token_reduction: format!("{:.1}%", self.token_reduction_pct),
            cost_savings_per_1m_queries: format!("${:.2}", self.cost_savings_per_1m_queries),
            cost_multiplier: if self.cost_multiplier.is_finite() {
                format!("{:.1}x cheaper", self.cost_multiplier)
            } else {
                "free".to_string()
            },
        }
    }
}

pub fn write_report(path: &Path, report: &MetricsReport) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

pub fn read_report(path: &Path) -> TrainingResult<MetricsReport> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}
