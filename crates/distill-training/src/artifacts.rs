use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::run::{RunId, RunSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One line of the loss log: `run_id,step,loss,avg_loss,step_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct LossLine {
    pub run_id: RunId,
    pub step: u64,
    pub loss: f64,
    pub avg_loss: f64,
    pub step_seconds: f64,
}

impl LossLine {
    fn render(&self) -> String {
        format!(
            "{},{},{:.6},{:.6},{:.4}\n",
            self.run_id, self.step, self.loss, self.avg_loss, self.step_seconds
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(',');
        let line = Self {
            run_id: RunId(parts.next()?.to_string()),
            step: parts.next()?.parse().ok()?,
            loss: parts.next()?.parse().ok()?,
            avg_loss: parts.next()?.parse().ok()?,
            step_seconds: parts.next()?.parse().ok()?,
        };
        parts.next().is_none().then_some(line)
    }
}

/// Append-only `loss.txt`, shared by every run of the experiment.
#[derive(Debug, Clone)]
pub struct LossLog {
    path: PathBuf,
}

impl LossLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, line: &LossLine) -> TrainingResult<()> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.render().as_bytes())?;
        Ok(())
    }

    /// Reads every well-formed line; a missing file reads as empty.
    pub fn read(&self) -> TrainingResult<Vec<LossLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter_map(LossLine::parse).collect())
    }

    /// Lines written by `run_id`, in file order.
    pub fn read_run(&self, run_id: &RunId) -> TrainingResult<Vec<LossLine>> {
        Ok(self.read()?.into_iter().filter(|l| &l.run_id == run_id).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Saved every `save_every` steps; resumable.
    Periodic,
    /// Full training state at the end of the run.
    Final,
    /// Weights exported for sampling.
    Sampler,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub name: String,
    pub run_id: RunId,
    pub step: u64,
    pub kind: CheckpointKind,
    /// Service-side locator.
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// `checkpoints.jsonl`: one record per checkpoint the run saved.
#[derive(Debug, Clone)]
pub struct CheckpointLedger {
    path: PathBuf,
}

impl CheckpointLedger {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, record: &CheckpointRecord) -> TrainingResult<()> {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    pub fn read(&self) -> TrainingResult<Vec<CheckpointRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(idx, l)| {
                serde_json::from_str(l).map_err(|e| {
                    TrainingError::Dataset(format!(
                        "{}: line {}: {}",
                        self.path.display(),
                        idx + 1,
                        e
                    ))
                })
            })
            .collect()
    }

    /// The last periodic checkpoint appended, i.e. the one the most recent run saved last.
    pub fn latest_periodic(&self) -> TrainingResult<Option<CheckpointRecord>> {
        Ok(self.read()?.into_iter().rev().find(|r| r.kind == CheckpointKind::Periodic))
    }

    pub fn find(&self, name: &str) -> TrainingResult<Option<CheckpointRecord>> {
        Ok(self.read()?.into_iter().rev().find(|r| r.name == name))
    }
}

/// Written once at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub experiment: String,
    pub created_at: DateTime<Utc>,
    pub base_model: String,
    pub lora_rank: u32,
    pub dataset_id: DatasetId,
    pub num_examples: usize,
    pub summary: RunSummary,
    pub checkpoints: Vec<CheckpointRecord>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(run: &str, step: u64, loss: f64) -> LossLine {
        LossLine { run_id: RunId(run.into()), step, loss, avg_loss: loss, step_seconds: 1.0 }
    }

    fn record(run: &str, step: u64, kind: CheckpointKind) -> CheckpointRecord {
        CheckpointRecord {
            name: format!("exp_{run}_step_{step}"),
            run_id: RunId(run.into()),
            step,
            kind,
            path: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_loss_line_format() {
        let line = LossLine {
            run_id: RunId("ab12cd34".into()),
            step: 10,
            loss: 1.234_567_89,
            avg_loss: 2.0,
            step_seconds: 0.123_456,
        };
        assert_eq!(line.render(), "ab12cd34,10,1.234568,2.000000,0.1235\n");
        assert_eq!(LossLine::parse(&line.render()).unwrap().step, 10);
        assert!(LossLine::parse("10,1.0,1.0,0.1").is_none());
    }

    #[test]
    fn test_loss_log_append_and_read() {
        let temp = TempDir::new().unwrap();
        let log = LossLog::new(temp.path().join("loss.txt"));
        assert!(log.read().unwrap().is_empty());

        log.append(&line("run00001", 0, 3.5)).unwrap();
        log.append(&line("run00001", 10, f64::NAN)).unwrap();

        let lines = log.read().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].step, 0);
        assert!(lines[1].loss.is_nan());
    }

    #[test]
    fn test_read_run_filters_other_runs() {
        let temp = TempDir::new().unwrap();
        let log = LossLog::new(temp.path().join("loss.txt"));
        for step in [0, 2, 4] {
            log.append(&line("aaaaaaaa", step, 2.0)).unwrap();
        }
        log.append(&line("bbbbbbbb", 0, 5.0)).unwrap();

        let b = log.read_run(&RunId("bbbbbbbb".into())).unwrap();
        assert_eq!(b.len(), 1);
        assert!((b[0].loss - 5.0).abs() < f64::EPSILON);
        assert_eq!(log.read_run(&RunId("aaaaaaaa".into())).unwrap().len(), 3);
    }

    #[test]
    fn test_ledger_latest_periodic_is_last_appended() {
        let temp = TempDir::new().unwrap();
        let ledger = CheckpointLedger::new(temp.path().join("checkpoints.jsonl"));
        ledger.append(&record("aaaaaaaa", 9, CheckpointKind::Periodic)).unwrap();
        ledger.append(&record("aaaaaaaa", 10, CheckpointKind::Final)).unwrap();
        ledger.append(&record("bbbbbbbb", 3, CheckpointKind::Periodic)).unwrap();
        ledger.append(&record("bbbbbbbb", 6, CheckpointKind::Periodic)).unwrap();

        let latest = ledger.latest_periodic().unwrap().unwrap();
        assert_eq!(latest.name, "exp_bbbbbbbb_step_6");
        assert_eq!(ledger.read().unwrap().len(), 4);
        assert_eq!(
            ledger.find("exp_aaaaaaaa_step_9").unwrap().unwrap().run_id,
            RunId("aaaaaaaa".into())
        );
        assert!(ledger.find("exp_cccccccc_step_1").unwrap().is_none());
    }
}
