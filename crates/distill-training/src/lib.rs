//! Distill Training
//!
//! Service-agnostic persona distillation:
//! - Converting teacher records into student conversations (`dataset`)
//! - Building loss-masked, shifted training tensors (`tensor`)
//! - Driving the pipelined step loop with checkpoints (`orchestrator`)
//! - Comparing student and teacher outputs (`evaluator`, `metrics`)
//! - Resumable bulk teacher generation (`generate`)

pub mod artifacts;
pub mod audit;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod generate;
pub mod layout;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod run;
pub mod similarity;
pub mod split;
pub mod template;
pub mod tensor;

pub use artifacts::{
    CheckpointKind, CheckpointLedger, CheckpointRecord, LossLine, LossLog, RunManifest,
};
pub use audit::{audit, DatasetAudit};
pub use config::DistillConfig;
pub use dataset::{
    ConversationExample, ConverterOptions, DatasetId, PromptExtraction, RawExample, convert_all,
    convert_example, read_conversations, read_raw_examples, write_conversations,
};
pub use error::{DataQualityError, TrainingError, TrainingResult};
pub use evaluator::{
    EvalModels, EvaluationRecord, Evaluator, read_evaluation_results, write_evaluation_results,
};
pub use generate::{
    BulkGenerator, GenerationReport, QuestionPolicy, QuestionSource, TeacherRecord,
};
pub use layout::RunLayout;
pub use metrics::{MetricsReport, MetricsSummary, summarize};
pub use orchestrator::{
    OrchestratorSettings, TrainingOrchestrator, TrainingOutcome, weighted_mean_nll,
};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, Stage, StdoutProgressSink};
pub use run::{
    CheckpointNaming, ResumePoint, RunId, RunSummary, TrainingRun, parse_checkpoint_run,
    parse_checkpoint_step,
};
pub use similarity::similarity_ratio;
pub use split::{Split, split_dataset};
pub use tensor::{TensorBuilder, TensorReport};
