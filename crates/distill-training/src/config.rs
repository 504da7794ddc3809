//! Run configuration.
//!
//! A single TOML file (`distill.toml`) with one table per concern. Every field
//! has a default, so an empty file is a valid configuration for a mock run.

use crate::error::{TrainingError, TrainingResult};
use crate::dataset::PromptExtraction;
use crate::generate::QuestionPolicy;
use distill_abstraction::{AdamParams, SamplingParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub checkpointing: CheckpointConfig,
    pub logging: LoggingConfig,
    pub data: DataConfig,
    pub metadata: MetadataConfig,
    pub evaluation: EvaluationConfig,
    pub generation: GenerationConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Student base model fine-tuned by the run.
    pub base_model: String,
    /// Rank of the trainable low-rank adapter.
    pub lora_rank: u32,
    /// Model sampled with the full persona prompt.
    pub teacher_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_model: "Qwen/Qwen3-4B-Instruct-2507".to_string(),
            lora_rank: 32,
            teacher_model: "Qwen/Qwen3-30B-A3B".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub num_steps: u64,
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let adam = AdamParams::default();
        Self {
            learning_rate: adam.learning_rate,
            beta1: adam.beta1,
            beta2: adam.beta2,
            eps: adam.eps,
            num_steps: 1000,
            batch_size: 1,
        }
    }
}

impl TrainingConfig {
    #[must_use]
    pub fn adam(&self) -> AdamParams {
        AdamParams {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub save_every: u64,
    pub output_dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { save_every: 100, output_dir: PathBuf::from("checkpoints") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_every: u64,
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_every: 10, log_dir: PathBuf::from("logs") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_file: PathBuf,
    pub val_file: PathBuf,
    pub max_seq_length: usize,
    pub train_ratio: f64,
    pub seed: u64,
    pub min_response_words: usize,
    pub prompt_extraction: PromptExtraction,
    /// File holding the persona prompt the teacher is conditioned on.
    pub persona_file: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_file: PathBuf::from("train.jsonl"),
            val_file: PathBuf::from("val.jsonl"),
            max_seq_length: 2048,
            train_ratio: 0.9,
            seed: 42,
            min_response_words: 20,
            prompt_extraction: PromptExtraction::Verbatim,
            persona_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub experiment_name: String,
    pub character_name: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            experiment_name: "persona_distill".to_string(),
            character_name: "Beethoven".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Held-out examples to evaluate; `None` evaluates all of them.
    pub num_samples: Option<usize>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Dollars per million prompt tokens.
    pub price_per_million_tokens: f64,
    pub results_file: PathBuf,
    pub report_file: PathBuf,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            num_samples: None,
            max_tokens: 300,
            temperature: 0.7,
            price_per_million_tokens: 0.06,
            results_file: PathBuf::from("evaluation_results.json"),
            report_file: PathBuf::from("metrics_report.json"),
        }
    }
}

impl EvaluationConfig {
    #[must_use]
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams { max_tokens: self.max_tokens, temperature: self.temperature, stop: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum in-flight teacher requests.
    pub concurrency: usize,
    /// Completed records buffered before each append to disk.
    pub flush_every: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub question_policy: QuestionPolicy,
    pub output_file: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            flush_every: 10,
            max_tokens: 300,
            temperature: 0.7,
            question_policy: QuestionPolicy::Cycle,
            output_file: PathBuf::from("teacher_data.jsonl"),
        }
    }
}

impl GenerationConfig {
    #[must_use]
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams { max_tokens: self.max_tokens, temperature: self.temperature, stop: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// `remote` or `mock`.
    pub kind: String,
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub tokenizer_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            kind: "remote".to_string(),
            base_url: None,
            api_key_env: "DISTILL_API_KEY".to_string(),
            tokenizer_path: None,
            poll_interval_ms: 250,
            request_timeout_secs: 600,
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn invalid(msg: impl Into<String>) -> TrainingError {
    TrainingError::Config(msg.into())
}

impl DistillConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        debug!(
            path = %path.display(),
            experiment = %config.metadata.experiment_name,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> TrainingResult<Self> {
        match path {
            Some(p) => Self::load_from_file(p),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> TrainingResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| invalid(format!("failed to serialize: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reads the persona prompt named by `data.persona_file`.
    pub fn persona(&self) -> TrainingResult<String> {
        let path = self
            .data
            .persona_file
            .as_ref()
            .ok_or_else(|| invalid("data.persona_file is required for teacher sampling"))?;
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("failed to read persona {}: {}", path.display(), e)))?;
        if text.trim().is_empty() {
            return Err(invalid(format!("persona file {} is empty", path.display())));
        }
        Ok(text.trim_end().to_string())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.model.base_model.trim().is_empty() {
            return Err(invalid("model.base_model is required"));
        }
        if self.model.teacher_model.trim().is_empty() {
            return Err(invalid("model.teacher_model is required"));
        }
        if self.model.lora_rank == 0 {
            return Err(invalid("model.lora_rank must be >= 1"));
        }

        let t = &self.training;
        if !t.learning_rate.is_finite() || t.learning_rate <= 0.0 {
            return Err(invalid("training.learning_rate must be > 0"));
        }
        for (name, beta) in [("beta1", t.beta1), ("beta2", t.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(invalid(format!("training.{name} must be in [0, 1)")));
            }
        }
        if !t.eps.is_finite() || t.eps <= 0.0 {
            return Err(invalid("training.eps must be > 0"));
        }
        if t.num_steps == 0 {
            return Err(invalid("training.num_steps must be >= 1"));
        }
        if t.batch_size == 0 {
            return Err(invalid("training.batch_size must be >= 1"));
        }
        if self.checkpointing.save_every == 0 {
            return Err(invalid("checkpointing.save_every must be >= 1"));
        }
        if self.logging.log_every == 0 {
            return Err(invalid("logging.log_every must be >= 1"));
        }

        let d = &self.data;
        if d.max_seq_length < 2 {
            return Err(invalid("data.max_seq_length must be >= 2"));
        }
        if !(d.train_ratio > 0.0 && d.train_ratio < 1.0) {
            return Err(invalid("data.train_ratio must be in (0, 1)"));
        }
        if self.metadata.experiment_name.trim().is_empty() {
            return Err(invalid("metadata.experiment_name is required"));
        }

        let price = self.evaluation.price_per_million_tokens;
        if price < 0.0 || !price.is_finite() {
            return Err(invalid("evaluation.price_per_million_tokens must be >= 0"));
        }
        if self.generation.concurrency == 0 {
            return Err(invalid("generation.concurrency must be >= 1"));
        }
        if self.generation.flush_every == 0 {
            return Err(invalid("generation.flush_every must be >= 1"));
        }
        Ok(())
    }

    /// Checks the `[service]` table. Only commands that talk to the service need it.
    pub fn validate_service(&self) -> TrainingResult<()> {
        match self.service.kind.as_str() {
            "mock" => {}
            "remote" => {
                if self.service.base_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                    return Err(invalid(
                        "service.base_url is required when service.kind = \"remote\"",
                    ));
                }
            }
            other => {
                return Err(invalid(format!(
                    "unknown service.kind '{other}' (expected remote or mock)"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mock_config() -> DistillConfig {
        let mut config = DistillConfig::default();
        config.service.kind = "mock".to_string();
        config
    }

    #[test]
    fn test_defaults_match_reference_values() {
        let config = DistillConfig::default();
        assert!((config.training.learning_rate - 1e-4).abs() < f64::EPSILON);
        assert_eq!(config.training.num_steps, 1000);
        assert_eq!(config.checkpointing.save_every, 100);
        assert_eq!(config.logging.log_every, 10);
        assert_eq!(config.data.max_seq_length, 2048);
        assert_eq!(config.data.seed, 42);
        assert_eq!(config.model.lora_rank, 32);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [training]
            num_steps = 5
            learning_rate = 2e-4

            [service]
            kind = "mock"
        "#;
        let config: DistillConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.training.num_steps, 5);
        assert_eq!(config.training.batch_size, 1);
        assert!((config.training.beta2 - 0.95).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
        assert!(config.validate_service().is_ok());
    }

    #[test]
    fn test_remote_without_base_url_is_rejected() {
        assert!(DistillConfig::default().validate().is_ok());
        let err = DistillConfig::default().validate_service().unwrap_err();
        assert!(matches!(err, TrainingError::Config(msg) if msg.contains("base_url")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut c = mock_config();
        c.training.beta1 = 1.0;
        assert!(c.validate().is_err());

        let mut c = mock_config();
        c.data.train_ratio = 1.5;
        assert!(c.validate().is_err());

        let mut c = mock_config();
        c.logging.log_every = 0;
        assert!(c.validate().is_err());

        let mut c = mock_config();
        c.service.kind = "grpc".to_string();
        assert!(c.validate_service().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("distill.toml");
        let mut config = mock_config();
        config.metadata.experiment_name = "exp".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = DistillConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_persona_requires_file() {
        let temp = TempDir::new().unwrap();
        let mut config = mock_config();
        assert!(config.persona().is_err());

        let path = temp.path().join("persona.txt");
        std::fs::write(&path, "You are Beethoven.\n").unwrap();
        config.data.persona_file = Some(path);
        assert_eq!(config.persona().unwrap(), "You are Beethoven.");
    }
}
