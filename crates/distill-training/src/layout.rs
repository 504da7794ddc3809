use crate::artifacts::{CheckpointLedger, LossLog};
use crate::config::DistillConfig;
use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout for a run's local artifacts.
///
/// Checkpoint weights live on the training service; locally the run keeps only
/// the loss log, the checkpoint ledger, and the manifest.
#[derive(Debug, Clone)]
pub struct RunLayout {
    checkpoint_dir: PathBuf,
    log_dir: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(checkpoint_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self { checkpoint_dir, log_dir }
    }

    /// Layout from `checkpointing.output_dir` and `logging.log_dir`.
    #[must_use]
    pub fn from_config(config: &DistillConfig) -> Self {
        Self::new(config.checkpointing.output_dir.clone(), config.logging.log_dir.clone())
    }

    /// Both directories under one root, for tests and scratch runs.
    #[must_use]
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("checkpoints"), root.join("logs"))
    }

    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn loss_log_path(&self) -> PathBuf {
        self.log_dir.join("loss.txt")
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.checkpoint_dir.join("checkpoints.jsonl")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.checkpoint_dir.join("run_manifest.json")
    }

    #[must_use]
    pub fn loss_log(&self) -> LossLog {
        LossLog::new(self.loss_log_path())
    }

    #[must_use]
    pub fn ledger(&self) -> CheckpointLedger {
        CheckpointLedger::new(self.ledger_path())
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
