//! Conversation → loss-masked next-token tensors.
//!
//! The full conversation and its prompt-only prefix are tokenized separately;
//! the prefix length marks where gradient signal starts. Sequences are cut at
//! `max_length` from the back, then shifted by one so that `input[i]` predicts
//! `target[i]` and `weights[i]` gates that prediction.

use crate::dataset::ConversationExample;
use crate::error::{DataQualityError, ServiceContext, TrainingResult};
use crate::template::{assistant_header, render_conversation};
use distill_abstraction::{Tokenizer, TrainingTensor};
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds [`TrainingTensor`]s under a maximum sequence length.
#[derive(Clone)]
pub struct TensorBuilder {
    tokenizer: Arc<dyn Tokenizer>,
    max_length: usize,
}

impl std::fmt::Debug for TensorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorBuilder")
            .field("max_length", &self.max_length)
            .finish_non_exhaustive()
    }
}

/// Tensors built from a dataset, plus how many examples were rejected.
#[derive(Debug, Clone, Default)]
pub struct TensorReport {
    pub tensors: Vec<TrainingTensor>,
    pub rejected: usize,
}

impl TensorBuilder {
    #[must_use]
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_length: usize) -> Self {
        Self { tokenizer, max_length }
    }

    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Builds one tensor.
    ///
    /// # Errors
    /// `DataQuality(NoTrainableRegion)` when truncation leaves no response token to
    /// predict; `Service` when the tokenizer fails.
    pub fn build(&self, example: &ConversationExample) -> TrainingResult<TrainingTensor> {
        let messages = example.messages();
        let full_text = render_conversation(messages);
        let mut prefix_text = render_conversation(&messages[..messages.len() - 1]);
        prefix_text.push_str(&assistant_header());

        let mut tokens = self
            .tokenizer
            .encode(&full_text, None)
            .context_with(|| "tokenizing conversation".to_string())?;
        tokens.truncate(self.max_length);
        let prefix_len = self
            .tokenizer
            .count_tokens(&prefix_text)
            .context_with(|| "tokenizing prompt prefix".to_string())?;
        let total_len = tokens.len();

        // The shift drops position 0, so at least one weighted token must sit past it.
        if total_len <= prefix_len.max(1) {
            return Err(DataQualityError::NoTrainableRegion { prefix_len, total_len }.into());
        }

        let weights: Vec<f32> =
            (0..total_len).map(|i| if i < prefix_len { 0.0 } else { 1.0 }).collect();

        let input = tokens[..total_len - 1].to_vec();
        let target = tokens[1..].to_vec();
        let loss_weights = weights[1..].to_vec();

        let tensor =
            TrainingTensor::new(input, target, loss_weights).map_err(DataQualityError::from)?;
        debug!(prefix_len, total_len, trainable = total_len - prefix_len, "Built training tensor");
        Ok(tensor)
    }

    /// Builds tensors for every example, skipping data-quality rejects.
    ///
    /// Tokenizer failures abort the whole build.
    pub fn build_all(&self, examples: &[ConversationExample]) -> TrainingResult<TensorReport> {
        let mut report = TensorReport::default();
        for (idx, example) in examples.iter().enumerate() {
            match self.build(example) {
                Ok(tensor) => report.tensors.push(tensor),
                Err(e) if e.is_data_quality() => {
                    warn!(idx, reason = %e, "Rejecting example");
                    report.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}
