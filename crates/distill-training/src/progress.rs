use crate::run::RunId;
use serde::{Deserialize, Serialize};

/// Which pipeline stage an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generate,
    Train,
    Evaluate,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Train => "train",
            Self::Evaluate => "evaluate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, stage: Stage, total: Option<u64> },
    Message { run_id: RunId, stage: Stage, message: String },
    /// A training log point.
    Step { run_id: RunId, step: u64, total: u64, loss: f64, avg_loss: f64, step_seconds: f64 },
    Checkpoint { run_id: RunId, name: String, step: u64 },
    /// Items completed so far in a generation or evaluation stage.
    Items { run_id: RunId, stage: Stage, done: u64, total: u64 },
    Finished { run_id: RunId, stage: Stage },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, stage, total } => match total {
                Some(total) => println!("[{}:{run_id}] started ({total} total)", stage.as_str()),
                None => println!("[{}:{run_id}] started", stage.as_str()),
            },
            ProgressEvent::Message { run_id, stage, message } => {
                println!("[{}:{run_id}] {message}", stage.as_str());
            }
            ProgressEvent::Step { run_id, step, total, loss, avg_loss, step_seconds } => {
                println!(
                    "[train:{run_id}] step {step:4}/{total}: loss={loss:.4}, \
                     avg_loss={avg_loss:.4}, step_time={step_seconds:.2}s"
                );
            }
            ProgressEvent::Checkpoint { run_id, name, step } => {
                println!("[train:{run_id}] checkpoint '{name}' saved at step {step}");
            }
            ProgressEvent::Items { run_id, stage, done, total } => {
                println!("[{}:{run_id}] {done}/{total}", stage.as_str());
            }
            ProgressEvent::Finished { run_id, stage } => {
                println!("[{}:{run_id}] finished", stage.as_str());
            }
        }
    }
}
