use crate::artifacts::CheckpointRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short identifier for one training process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Eight hex characters from a fresh v4 UUID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..8].to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Checkpoint names for one run. Every name embeds the run id, so two runs of
/// the same experiment never overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointNaming {
    experiment: String,
    run_id: RunId,
}

impl CheckpointNaming {
    #[must_use]
    pub fn new(experiment: impl Into<String>, run_id: RunId) -> Self {
        Self { experiment: experiment.into(), run_id }
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[must_use]
    pub fn periodic(&self, step: u64) -> String {
        format!("{}_{}_step_{}", self.experiment, self.run_id, step)
    }

    #[must_use]
    pub fn final_checkpoint(&self) -> String {
        format!("{}_{}_final_checkpoint", self.experiment, self.run_id)
    }

    /// Name of the sampler weights saved at the end of training.
    #[must_use]
    pub fn sampler(&self) -> String {
        format!("{}_{}_final", self.experiment, self.run_id)
    }
}

/// Recovers the step from a periodic checkpoint name (`..._step_{n}`).
#[must_use]
pub fn parse_checkpoint_step(name: &str) -> Option<u64> {
    let (_, step) = name.rsplit_once("_step_")?;
    step.parse().ok()
}

/// Recovers the run id from a periodic checkpoint name (`{experiment}_{run_id}_step_{n}`).
#[must_use]
pub fn parse_checkpoint_run(name: &str) -> Option<RunId> {
    let (prefix, step) = name.rsplit_once("_step_")?;
    step.parse::<u64>().ok()?;
    let (_, run) = prefix.rsplit_once('_')?;
    Some(RunId(run.to_string()))
}

/// Where a resumed run picks up: the checkpoint to load and the step it was saved at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub checkpoint: String,
    pub step: u64,
}

impl ResumePoint {
    /// Builds a resume point from a periodic checkpoint name.
    #[must_use]
    pub fn from_checkpoint(name: &str) -> Option<Self> {
        parse_checkpoint_step(name).map(|step| Self { checkpoint: name.to_string(), step })
    }

    /// The first step the resumed run executes.
    #[must_use]
    pub fn next_step(&self) -> u64 {
        self.step + 1
    }
}

/// Mutable state of the step loop, returned when training ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingRun {
    /// Next step to execute.
    pub step: u64,
    pub loss_history: Vec<f64>,
    /// Wall time per step, in seconds.
    pub step_durations: Vec<f64>,
    pub checkpoints: Vec<CheckpointRecord>,
}

impl TrainingRun {
    #[must_use]
    pub fn starting_at(step: u64) -> Self {
        Self { step, ..Self::default() }
    }

    pub fn record_step(&mut self, loss: f64, seconds: f64) {
        self.loss_history.push(loss);
        self.step_durations.push(seconds);
        self.step += 1;
    }

    /// Mean of the last `window` losses, or of all of them when fewer exist.
    #[must_use]
    pub fn trailing_mean_loss(&self, window: usize) -> f64 {
        trailing_mean(&self.loss_history, window)
    }

    #[must_use]
    pub fn trailing_mean_step_time(&self, window: usize) -> f64 {
        trailing_mean(&self.step_durations, window)
    }

    #[must_use]
    pub fn summary(&self) -> RunSummary {
        let total_seconds: f64 = self.step_durations.iter().sum();
        RunSummary {
            steps_completed: self.loss_history.len() as u64,
            final_loss: self.loss_history.last().copied(),
            mean_loss_last_10: (!self.loss_history.is_empty()).then(|| self.trailing_mean_loss(10)),
            total_seconds,
            mean_step_seconds: (!self.step_durations.is_empty())
                .then(|| total_seconds / self.step_durations.len() as f64),
        }
    }
}

fn trailing_mean(values: &[f64], window: usize) -> f64 {
    let tail = &values[values.len().saturating_sub(window.max(1))..];
    if tail.is_empty() {
        return f64::NAN;
    }
    tail.iter().sum::<f64>() / tail.len() as f64
}

/// End-of-run numbers for display and the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps_completed: u64,
    pub final_loss: Option<f64>,
    pub mean_loss_last_10: Option<f64>,
    pub total_seconds: f64,
    pub mean_step_seconds: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_eight_hex() {
        let id = RunId::new();
        assert_eq!(id.0.len(), 8);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checkpoint_names_are_unique_per_run_and_step() {
        let a = CheckpointNaming::new("exp", RunId("aaaa0000".into()));
        let b = CheckpointNaming::new("exp", RunId("bbbb1111".into()));
        assert_eq!(a.periodic(100), "exp_aaaa0000_step_100");
        assert_ne!(a.periodic(100), a.periodic(200));
        assert_ne!(a.periodic(100), b.periodic(100));
        assert_eq!(a.final_checkpoint(), "exp_aaaa0000_final_checkpoint");
        assert_eq!(a.sampler(), "exp_aaaa0000_final");
    }

    #[test]
    fn test_parse_checkpoint_step() {
        assert_eq!(parse_checkpoint_step("my_exp_ab12cd34_step_300"), Some(300));
        assert_eq!(parse_checkpoint_step("beethoven_step_42"), Some(42));
        assert_eq!(parse_checkpoint_step("exp_final_checkpoint"), None);
        assert_eq!(ResumePoint::from_checkpoint("x_step_9").unwrap().next_step(), 10);
    }

    #[test]
    fn test_parse_checkpoint_run() {
        assert_eq!(
            parse_checkpoint_run("my_exp_ab12cd34_step_300"),
            Some(RunId("ab12cd34".into()))
        );
        assert_eq!(parse_checkpoint_run("beethoven_step_42"), Some(RunId("beethoven".into())));
        assert_eq!(parse_checkpoint_run("step_42"), None);
        assert_eq!(parse_checkpoint_run("exp_ab12cd34_final_checkpoint"), None);
    }

    #[test]
    fn test_trailing_mean_uses_all_when_short() {
        let mut run = TrainingRun::default();
        run.record_step(1.0, 0.1);
        run.record_step(3.0, 0.1);
        assert!((run.trailing_mean_loss(10) - 2.0).abs() < f64::EPSILON);
        run.record_step(5.0, 0.1);
        assert!((run.trailing_mean_loss(2) - 4.0).abs() < f64::EPSILON);
        assert!((run.trailing_mean_step_time(10) - 0.1).abs() < 1e-12);
        assert_eq!(run.step, 3);
    }

    #[test]
    fn test_summary_of_empty_run() {
        let summary = TrainingRun::default().summary();
        assert_eq!(summary.steps_completed, 0);
        assert!(summary.final_loss.is_none());
        assert!(summary.mean_step_seconds.is_none());
    }
}
