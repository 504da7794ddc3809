use crate::dataset::RawExample;
use crate::template::word_count;
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WordStats {
    pub mean: f64,
    pub min: usize,
    pub max: usize,
}

impl WordStats {
    fn of(counts: &[usize]) -> Self {
        if counts.is_empty() {
            return Self::default();
        }
        Self {
            mean: counts.iter().sum::<usize>() as f64 / counts.len() as f64,
            min: counts.iter().copied().min().unwrap_or(0),
            max: counts.iter().copied().max().unwrap_or(0),
        }
    }
}

/// Shape of a raw dataset before conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetAudit {
    pub count: usize,
    pub empty_prompts: usize,
    pub empty_responses: usize,
    pub prompt_words: WordStats,
    pub response_words: WordStats,
    pub unique_sources: usize,
    pub unique_responses: usize,
    /// Share of records whose response repeats an earlier one, 0..=1.
    pub duplicate_rate: f64,
}

#[must_use]
pub fn audit(records: &[RawExample]) -> DatasetAudit {
    let prompt_words: Vec<usize> =
        records.iter().map(|r| word_count(&r.prompt_or_question)).collect();
    let response_words: Vec<usize> = records.iter().map(|r| word_count(&r.response)).collect();
    let unique_responses = records.iter().map(|r| r.response.trim()).collect::<HashSet<_>>().len();
    let unique_sources =
        records.iter().filter_map(|r| r.source.as_deref()).collect::<HashSet<_>>().len();

    let duplicate_rate = if records.is_empty() {
        0.0
    } else {
        (records.len() - unique_responses) as f64 / records.len() as f64
    };

    DatasetAudit {
        count: records.len(),
        empty_prompts: records.iter().filter(|r| r.prompt_or_question.trim().is_empty()).count(),
        empty_responses: records.iter().filter(|r| r.response.trim().is_empty()).count(),
        prompt_words: WordStats::of(&prompt_words),
        response_words: WordStats::of(&response_words),
        unique_sources,
        unique_responses,
        duplicate_rate,
    }
}

impl DatasetAudit {
    pub fn log(&self) {
        info!(
            count = self.count,
            empty_prompts = self.empty_prompts,
            empty_responses = self.empty_responses,
            mean_response_words = self.response_words.mean,
            min_response_words = self.response_words.min,
            max_response_words = self.response_words.max,
            unique_sources = self.unique_sources,
            duplicate_rate = self.duplicate_rate,
            "Dataset audit"
        );
    }
}
