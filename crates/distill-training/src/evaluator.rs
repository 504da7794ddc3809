//! Student vs teacher comparison on held-out questions.

use crate::dataset::ConversationExample;
use crate::error::{ServiceContext, TrainingResult};
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink, Stage};
use crate::run::RunId;
use crate::similarity::similarity_ratio;
use crate::template::{student_prompt, teacher_prompt};
use distill_abstraction::{SamplingClient, SamplingParams, ServiceProvider, Tokenizer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const PROGRESS_EVERY: usize = 10;

/// One held-out comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub question: String,
    pub student_response: String,
    pub teacher_response: String,
    pub similarity: f64,
    /// Tokens in the prompt-free student prompt.
    #[serde(rename = "student_tokens")]
    pub student_token_count: usize,
    /// Tokens in the persona-bearing teacher prompt.
    #[serde(rename = "teacher_tokens")]
    pub teacher_token_count: usize,
}

/// Where the student weights come from and who the teacher is.
#[derive(Debug, Clone)]
pub struct EvalModels {
    pub base_model: String,
    pub lora_rank: u32,
    pub teacher_model: String,
}

pub struct Evaluator {
    tokenizer: Arc<dyn Tokenizer>,
    student: Arc<dyn SamplingClient>,
    teacher: Arc<dyn SamplingClient>,
    persona: String,
    character_name: String,
    params: SamplingParams,
    run_id: RunId,
    progress: Arc<dyn ProgressSink>,
}

impl Evaluator {
    #[must_use]
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        student: Arc<dyn SamplingClient>,
        teacher: Arc<dyn SamplingClient>,
        persona: String,
        character_name: String,
        params: SamplingParams,
    ) -> Self {
        Self {
            tokenizer,
            student,
            teacher,
            persona,
            character_name,
            params,
            run_id: RunId::new(),
            progress: Arc::new(NullProgressSink),
        }
    }

    /// Restores `checkpoint` into a fresh session, exports it as `{checkpoint}_eval`,
    /// and pairs it with a sampler on the unmodified teacher model.
    pub async fn from_checkpoint(
        provider: &dyn ServiceProvider,
        models: &EvalModels,
        checkpoint: &str,
        tokenizer: Arc<dyn Tokenizer>,
        persona: String,
        character_name: String,
        params: SamplingParams,
    ) -> TrainingResult<Self> {
        let session = provider
            .create_training_session(&models.base_model, models.lora_rank)
            .await
            .context_with(|| format!("opening session on {}", models.base_model))?;
        session
            .load_checkpoint(checkpoint)
            .await
            .context_with(|| format!("loading checkpoint '{}'", checkpoint))?;

        let eval_name = format!("{checkpoint}_eval");
        let student = session
            .get_inference_handle(&eval_name)
            .await
            .context_with(|| format!("exporting sampler weights '{}'", eval_name))?;
        let teacher = provider
            .sampling_client(&models.teacher_model)
            .context_with(|| format!("opening sampler on {}", models.teacher_model))?;

        info!(
            checkpoint,
            student = student.model_id(),
            teacher = teacher.model_id(),
            "Evaluation models ready"
        );
        Ok(Self::new(tokenizer, student, teacher, persona, character_name, params))
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    async fn sample_text(
        &self,
        client: &dyn SamplingClient,
        prompt_tokens: &[u32],
        who: &str,
    ) -> TrainingResult<String> {
        let tokens = client
            .sample(prompt_tokens, &self.params)
            .await
            .context_with(|| format!("sampling {who} ({})", client.model_id()))?;
        self.tokenizer.decode(&tokens).context_with(|| format!("decoding {who} response"))
    }

    /// Samples both models for one question and scores the pair.
    pub async fn evaluate_question(&self, question: &str) -> TrainingResult<EvaluationRecord> {
        let student_tokens = self
            .tokenizer
            .encode(&student_prompt(question), None)
            .context_with(|| "tokenizing student prompt".to_string())?;
        let teacher_tokens = self
            .tokenizer
            .encode(&teacher_prompt(&self.persona, question, &self.character_name), None)
            .context_with(|| "tokenizing teacher prompt".to_string())?;

        let (student_response, teacher_response) = futures::try_join!(
            self.sample_text(self.student.as_ref(), &student_tokens, "student"),
            self.sample_text(self.teacher.as_ref(), &teacher_tokens, "teacher"),
        )?;

        let similarity = similarity_ratio(&student_response, &teacher_response);
        debug!(
            similarity,
            student_tokens = student_tokens.len(),
            teacher_tokens = teacher_tokens.len(),
            "Evaluated question"
        );

        Ok(EvaluationRecord {
            question: question.to_string(),
            student_response,
            teacher_response,
            similarity,
            student_token_count: student_tokens.len(),
            teacher_token_count: teacher_tokens.len(),
        })
    }

    /// Evaluates up to `limit` held-out examples, in order.
    pub async fn evaluate(
        &self,
        examples: &[ConversationExample],
        limit: Option<usize>,
    ) -> TrainingResult<Vec<EvaluationRecord>> {
        let take = limit.unwrap_or(examples.len()).min(examples.len());
        let total = take as u64;
        self.progress.on_event(ProgressEvent::Started {
            run_id: self.run_id.clone(),
            stage: Stage::Evaluate,
            total: Some(total),
        });

        let mut records = Vec::with_capacity(take);
        for (i, example) in examples.iter().take(take).enumerate() {
            records.push(self.evaluate_question(example.question()).await?);
            if (i + 1) % PROGRESS_EVERY == 0 {
                info!(done = i + 1, total, "Evaluation progress");
                self.progress.on_event(ProgressEvent::Items {
                    run_id: self.run_id.clone(),
                    stage: Stage::Evaluate,
                    done: (i + 1) as u64,
                    total,
                });
            }
        }

        let run_id = self.run_id.clone();
        self.progress.on_event(ProgressEvent::Finished { run_id, stage: Stage::Evaluate });
        Ok(records)
    }
}

/// Writes records as a pretty-printed JSON array.
pub fn write_evaluation_results(path: &Path, records: &[EvaluationRecord]) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(records)?)?;
    Ok(())
}

pub fn read_evaluation_results(path: &Path) -> TrainingResult<Vec<EvaluationRecord>> {
    Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use distill_abstraction::{ServiceError, ServiceResult};
    use tempfile::TempDir;

    struct ByteTok;

    impl Tokenizer for ByteTok {
        fn encode(&self, text: &str, _max_length: Option<usize>) -> ServiceResult<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, tokens: &[u32]) -> ServiceResult<String> {
            Ok(tokens.iter().filter_map(|t| u8::try_from(*t).ok()).map(char::from).collect())
        }
    }

    /// Always answers with the same text.
    struct FixedSampler(&'static str);

    #[async_trait]
    impl SamplingClient for FixedSampler {
        async fn sample(
            &self,
            _prompt: &[u32],
            _params: &SamplingParams,
        ) -> ServiceResult<Vec<u32>> {
            Ok(self.0.bytes().map(u32::from).collect())
        }

        fn model_id(&self) -> &str {
            self.0
        }
    }

    struct DownSampler;

    #[async_trait]
    impl SamplingClient for DownSampler {
        async fn sample(
            &self,
            _prompt: &[u32],
            _params: &SamplingParams,
        ) -> ServiceResult<Vec<u32>> {
            Err(ServiceError::RequestError("unavailable".into()))
        }

        fn model_id(&self) -> &str {
            "down"
        }
    }

    fn evaluator(student: Arc<dyn SamplingClient>) -> Evaluator {
        Evaluator::new(
            Arc::new(ByteTok),
            student,
            Arc::new(FixedSampler("Music is the mediator.")),
            "You are Beethoven.".to_string(),
            "Beethoven".to_string(),
            SamplingParams::default(),
        )
    }

    #[tokio::test]
    async fn test_record_token_counts_and_similarity() {
        let eval = evaluator(Arc::new(FixedSampler("Music is the mediator.")));
        let record = eval.evaluate_question("Why music?").await.unwrap();

        assert!((record.similarity - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.student_token_count, student_prompt("Why music?").len());
        assert_eq!(
            record.teacher_token_count,
            teacher_prompt("You are Beethoven.", "Why music?", "Beethoven").len()
        );
        assert!(record.teacher_token_count > record.student_token_count);
    }

    #[tokio::test]
    async fn test_evaluate_respects_limit() {
        let eval = evaluator(Arc::new(FixedSampler("Silence.")));
        let examples: Vec<_> =
            (0..5).map(|i| ConversationExample::new(format!("q{i}"), "a")).collect();
        let records = eval.evaluate(&examples, Some(3)).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].question, "q2");
        assert!(records[0].similarity < 1.0);
    }

    #[tokio::test]
    async fn test_sampling_failure_propagates() {
        let eval = evaluator(Arc::new(DownSampler));
        assert!(eval.evaluate_question("q").await.is_err());
    }

    #[test]
    fn test_results_file_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evaluation_results.json");
        let record = EvaluationRecord {
            question: "q".into(),
            student_response: "s".into(),
            teacher_response: "t".into(),
            similarity: 0.5,
            student_token_count: 10,
            teacher_token_count: 900,
        };
        write_evaluation_results(&path, std::slice::from_ref(&record)).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json[0]["student_tokens"], 10);
        assert_eq!(json[0]["teacher_tokens"], 900);
        assert_eq!(read_evaluation_results(&path).unwrap(), vec![record]);
    }
}
