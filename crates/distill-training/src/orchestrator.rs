//! The training step loop.
//!
//! Each step selects a batch, submits the forward-backward pass and the
//! optimizer step back to back (both in flight before either is awaited),
//! then collects both results and reduces the returned log-probabilities to a
//! weighted mean NLL. Steps are strictly sequential. Any service failure aborts
//! the run; the periodic checkpoints are the recovery path.

use crate::artifacts::{CheckpointKind, CheckpointLedger, CheckpointRecord, LossLine, LossLog};
use crate::config::DistillConfig;
use crate::error::{ServiceContext, TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink, Stage};
use crate::run::{CheckpointNaming, ResumePoint, RunId, TrainingRun, parse_checkpoint_run};
use chrono::Utc;
use distill_abstraction::{
    AdamParams, CheckpointRef, ForwardBackwardOutput, LossKind, SamplingClient, ServiceError,
    TrainingService, TrainingTensor,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Step-loop knobs, usually taken from [`DistillConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub num_steps: u64,
    pub batch_size: usize,
    pub log_every: u64,
    pub save_every: u64,
    pub adam: AdamParams,
    pub loss: LossKind,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_config(config: &DistillConfig) -> Self {
        Self {
            num_steps: config.training.num_steps,
            batch_size: config.training.batch_size,
            log_every: config.logging.log_every,
            save_every: config.checkpointing.save_every,
            adam: config.training.adam(),
            loss: LossKind::CrossEntropy,
        }
    }
}

/// What a finished run hands back.
pub struct TrainingOutcome {
    pub run: TrainingRun,
    pub final_checkpoint: CheckpointRef,
    /// Sampling client bound to the final weights.
    pub sampler: Arc<dyn SamplingClient>,
}

impl std::fmt::Debug for TrainingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingOutcome")
            .field("run", &self.run)
            .field("final_checkpoint", &self.final_checkpoint)
            .field("sampler", &self.sampler.model_id())
            .finish()
    }
}

/// Weighted mean negative log-likelihood over a batch.
///
/// `-Σ(logprob·weight) / Σweight`. When every weight in the batch is zero the
/// loss is undefined and NaN is returned.
///
/// # Errors
/// `ServiceError::SerializationError` if the service returned outputs that do
/// not line up with the batch.
pub fn weighted_mean_nll(
    batch: &[TrainingTensor],
    output: &ForwardBackwardOutput,
) -> Result<f64, ServiceError> {
    if output.loss_fn_outputs.len() != batch.len() {
        return Err(ServiceError::SerializationError(format!(
            "expected {} loss outputs, got {}",
            batch.len(),
            output.loss_fn_outputs.len()
        )));
    }

    let mut weighted = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for (idx, (tensor, out)) in batch.iter().zip(&output.loss_fn_outputs).enumerate() {
        if out.logprobs.len() != tensor.len() {
            return Err(ServiceError::SerializationError(format!(
                "example {}: {} logprobs for {} target tokens",
                idx,
                out.logprobs.len(),
                tensor.len()
            )));
        }
        for (lp, w) in out.logprobs.iter().zip(tensor.loss_weights()) {
            weighted += f64::from(*lp) * f64::from(*w);
            total_weight += f64::from(*w);
        }
    }

    if total_weight == 0.0 {
        return Ok(f64::NAN);
    }
    Ok(-weighted / total_weight)
}

/// `batch_size` consecutive examples starting at `(step * batch_size) % len`, wrapping.
#[must_use]
pub fn select_batch(
    examples: &[TrainingTensor],
    step: u64,
    batch_size: usize,
) -> Vec<TrainingTensor> {
    let len = examples.len();
    let start = (step as usize).wrapping_mul(batch_size) % len;
    (0..batch_size).map(|i| examples[(start + i) % len].clone()).collect()
}

#[derive(Debug, Default)]
struct PhaseTimings {
    batch_prep: Duration,
    submit_ops: Duration,
    fwd_bwd_wait: Duration,
    optim_wait: Duration,
    loss_calc: Duration,
}

/// Drives one training session from its first (or resumed) step to the final checkpoint.
pub struct TrainingOrchestrator {
    session: Box<dyn TrainingService>,
    settings: OrchestratorSettings,
    naming: CheckpointNaming,
    loss_log: Option<LossLog>,
    ledger: Option<CheckpointLedger>,
    progress: Arc<dyn ProgressSink>,
}

impl TrainingOrchestrator {
    #[must_use]
    pub fn new(
        session: Box<dyn TrainingService>,
        settings: OrchestratorSettings,
        naming: CheckpointNaming,
    ) -> Self {
        Self {
            session,
            settings,
            naming,
            loss_log: None,
            ledger: None,
            progress: Arc::new(NullProgressSink),
        }
    }

    /// Persist the loss log and checkpoint ledger under `layout`.
    #[must_use]
    pub fn with_layout(mut self, layout: &RunLayout) -> Self {
        self.loss_log = Some(layout.loss_log());
        self.ledger = Some(layout.ledger());
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Runs the step loop over `examples`.
    ///
    /// With a resume point the checkpoint is loaded first and the loop starts at
    /// the step after it; the loss history is seeded from the checkpoint's own
    /// run in the loss log when one is configured.
    pub async fn run(
        &self,
        examples: &[TrainingTensor],
        resume: Option<ResumePoint>,
    ) -> TrainingResult<TrainingOutcome> {
        if examples.is_empty() {
            return Err(TrainingError::InsufficientData("no training examples".to_string()));
        }
        let settings = &self.settings;
        if settings.batch_size == 0 || settings.log_every == 0 || settings.save_every == 0 {
            return Err(TrainingError::Config(
                "batch_size, log_every and save_every must be >= 1".to_string(),
            ));
        }

        let mut run = self.start(resume).await?;
        let num_steps = self.settings.num_steps;
        let run_id = self.naming.run_id().clone();
        let mut last_checkpoint: Option<String> = None;

        info!(
            run_id = %run_id,
            base_model = self.session.base_model(),
            examples = examples.len(),
            start_step = run.step,
            num_steps,
            batch_size = self.settings.batch_size,
            lr = self.settings.adam.learning_rate,
            "Starting training"
        );
        self.progress.on_event(ProgressEvent::Started {
            run_id: run_id.clone(),
            stage: Stage::Train,
            total: Some(num_steps),
        });

        while run.step < num_steps {
            let step = run.step;
            if let Err(e) = self.step(examples, &mut run).await {
                error!(
                    step,
                    last_checkpoint = ?last_checkpoint,
                    error = %e,
                    "Training step failed; resume from the last checkpoint"
                );
                return Err(e);
            }

            if step % self.settings.save_every == 0 && step > 0 {
                let name = self.naming.periodic(step);
                let record = self.save(&name, step, CheckpointKind::Periodic).await?;
                run.checkpoints.push(record);
                self.progress.on_event(ProgressEvent::Checkpoint {
                    run_id: run_id.clone(),
                    name: name.clone(),
                    step,
                });
                last_checkpoint = Some(name);
            }
        }

        let final_step = num_steps.saturating_sub(1);
        let final_name = self.naming.final_checkpoint();
        let record = self.save(&final_name, final_step, CheckpointKind::Final).await?;
        let final_checkpoint =
            CheckpointRef { name: record.name.clone(), path: record.path.clone() };
        run.checkpoints.push(record);

        let sampler_name = self.naming.sampler();
        let sampler = self
            .session
            .get_inference_handle(&sampler_name)
            .await
            .context_with(|| format!("exporting sampler weights '{}'", sampler_name))?;
        let record = CheckpointRecord {
            name: sampler_name,
            run_id: run_id.clone(),
            step: final_step,
            kind: CheckpointKind::Sampler,
            path: sampler.model_id().to_string(),
            created_at: Utc::now(),
        };
        self.append_ledger(&record)?;
        run.checkpoints.push(record);

        let summary = run.summary();
        info!(
            run_id = %run_id,
            steps = summary.steps_completed,
            final_loss = ?summary.final_loss,
            mean_loss_last_10 = ?summary.mean_loss_last_10,
            total_seconds = summary.total_seconds,
            "Training complete"
        );
        self.progress.on_event(ProgressEvent::Finished { run_id, stage: Stage::Train });

        Ok(TrainingOutcome { run, final_checkpoint, sampler })
    }

    async fn start(&self, resume: Option<ResumePoint>) -> TrainingResult<TrainingRun> {
        let Some(resume) = resume else {
            return Ok(TrainingRun::starting_at(0));
        };

        self.session
            .load_checkpoint(&resume.checkpoint)
            .await
            .context_with(|| format!("loading checkpoint '{}'", resume.checkpoint))?;

        let mut run = TrainingRun::starting_at(resume.next_step());
        let origin = self.origin_run(&resume.checkpoint)?;
        if let (Some(log), Some(origin)) = (&self.loss_log, &origin) {
            run.loss_history = log
                .read_run(origin)?
                .into_iter()
                .filter(|l| l.step <= resume.step)
                .map(|l| l.loss)
                .collect();
        }
        info!(
            checkpoint = %resume.checkpoint,
            origin_run = ?origin,
            next_step = run.step,
            seeded_losses = run.loss_history.len(),
            "Resumed from checkpoint"
        );
        Ok(run)
    }

    /// The run that saved `checkpoint`: from the ledger when it has the record,
    /// otherwise from the checkpoint name.
    fn origin_run(&self, checkpoint: &str) -> TrainingResult<Option<RunId>> {
        if let Some(ledger) = &self.ledger
            && let Some(record) = ledger.find(checkpoint)?
        {
            return Ok(Some(record.run_id));
        }
        Ok(parse_checkpoint_run(checkpoint))
    }

    async fn step(&self, examples: &[TrainingTensor], run: &mut TrainingRun) -> TrainingResult<()> {
        let step = run.step;
        let step_start = Instant::now();
        let mut timings = PhaseTimings::default();

        let t = Instant::now();
        let batch = select_batch(examples, step, self.settings.batch_size);
        timings.batch_prep = t.elapsed();

        let t = Instant::now();
        let fwd_bwd = self
            .session
            .submit_forward_backward(&batch, self.settings.loss)
            .await
            .context_with(|| format!("step {step}: submitting forward_backward"))?;
        let optim = self
            .session
            .submit_optimizer_step(&self.settings.adam)
            .await
            .context_with(|| format!("step {step}: submitting optim_step"))?;
        timings.submit_ops = t.elapsed();
        debug!(
            step,
            fwd_bwd = fwd_bwd.request_id(),
            optim = optim.request_id(),
            "Step requests in flight"
        );

        let t = Instant::now();
        let output =
            fwd_bwd.await.context_with(|| format!("step {step}: awaiting forward_backward"))?;
        timings.fwd_bwd_wait = t.elapsed();

        let t = Instant::now();
        optim.await.context_with(|| format!("step {step}: awaiting optim_step"))?;
        timings.optim_wait = t.elapsed();

        let t = Instant::now();
        let loss = weighted_mean_nll(&batch, &output)
            .context_with(|| format!("step {step}: collating loss"))?;
        timings.loss_calc = t.elapsed();

        let step_seconds = step_start.elapsed().as_secs_f64();
        run.record_step(loss, step_seconds);

        debug!(
            step,
            batch_prep_ms = timings.batch_prep.as_secs_f64() * 1e3,
            submit_ops_ms = timings.submit_ops.as_secs_f64() * 1e3,
            fwd_bwd_wait_ms = timings.fwd_bwd_wait.as_secs_f64() * 1e3,
            optim_wait_ms = timings.optim_wait.as_secs_f64() * 1e3,
            loss_calc_ms = timings.loss_calc.as_secs_f64() * 1e3,
            "Step timings"
        );

        let num_steps = self.settings.num_steps;
        if step % self.settings.log_every == 0 || step + 1 == num_steps {
            let window = self.settings.log_every as usize;
            let avg_loss = run.trailing_mean_loss(window);
            let avg_step_seconds = run.trailing_mean_step_time(window);
            info!(
                step,
                num_steps,
                loss,
                avg_loss,
                step_seconds,
                avg_step_seconds,
                "Training progress"
            );
            if let Some(log) = &self.loss_log {
                log.append(&LossLine {
                    run_id: self.naming.run_id().clone(),
                    step,
                    loss,
                    avg_loss,
                    step_seconds,
                })?;
            }
            self.progress.on_event(ProgressEvent::Step {
                run_id: self.naming.run_id().clone(),
                step,
                total: num_steps,
                loss,
                avg_loss,
                step_seconds,
            });
        }
        Ok(())
    }

    async fn save(
        &self,
        name: &str,
        step: u64,
        kind: CheckpointKind,
    ) -> TrainingResult<CheckpointRecord> {
        let saved = self
            .session
            .save_checkpoint(name)
            .await
            .context_with(|| format!("step {step}: saving checkpoint '{name}'"))?;
        info!(step, checkpoint = %saved.name, "Checkpoint saved");
        let record = CheckpointRecord {
            name: saved.name,
            run_id: self.naming.run_id().clone(),
            step,
            kind,
            path: saved.path,
            created_at: Utc::now(),
        };
        self.append_ledger(&record)?;
        Ok(record)
    }

    fn append_ledger(&self, record: &CheckpointRecord) -> TrainingResult<()> {
        match &self.ledger {
            Some(ledger) => ledger.append(record),
            None => Ok(()),
        }
    }
}
