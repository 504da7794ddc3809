//! Resumable bulk generation of teacher responses.
//!
//! Items are keyed by a stable index. A bounded pool of sampling tasks sends
//! completed records over a channel to a single writer that appends them to a
//! JSONL file in batches. Re-running against the same file skips every index
//! already on disk, so an interrupted run loses at most one unflushed batch.

use crate::error::{ServiceContext, TrainingError, TrainingResult};
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink, Stage};
use crate::run::RunId;
use crate::template::{teacher_prompt, word_count};
use distill_abstraction::{SamplingClient, SamplingParams, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do when more items are requested than there are distinct questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionPolicy {
    /// Reuse the list from the start, so questions repeat.
    #[default]
    Cycle,
    /// Fail instead of repeating any question.
    RejectInsufficient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationItem {
    pub index: usize,
    pub question: String,
}

#[derive(Debug, Clone)]
pub struct QuestionSource {
    questions: Vec<String>,
    policy: QuestionPolicy,
}

impl QuestionSource {
    pub fn new(questions: Vec<String>, policy: QuestionPolicy) -> TrainingResult<Self> {
        if questions.is_empty() {
            return Err(TrainingError::InsufficientData("question list is empty".to_string()));
        }
        Ok(Self { questions, policy })
    }

    /// One question per non-blank line.
    pub fn from_file(path: &Path, policy: QuestionPolicy) -> TrainingResult<Self> {
        let questions = std::fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        Self::new(questions, policy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// The first `count` items. Item `i` asks question `i % len`.
    pub fn items(&self, count: usize) -> TrainingResult<Vec<GenerationItem>> {
        if count > self.questions.len() {
            match self.policy {
                QuestionPolicy::RejectInsufficient => {
                    return Err(TrainingError::InsufficientData(format!(
                        "{} items requested but only {} distinct questions",
                        count,
                        self.questions.len()
                    )));
                }
                QuestionPolicy::Cycle => {
                    warn!(
                        count,
                        distinct = self.questions.len(),
                        "Cycling questions; responses will repeat prompts"
                    );
                }
            }
        }
        Ok((0..count)
            .map(|index| GenerationItem {
                index,
                question: self.questions[index % self.questions.len()].clone(),
            })
            .collect())
    }
}

/// One persisted teacher completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherRecord {
    pub index: usize,
    pub question: String,
    pub full_prompt: String,
    pub teacher_response: String,
    /// Persona length in words.
    pub prompt_tokens: usize,
    /// Full prompt length in words.
    pub total_prompt_length: usize,
}

/// Reads persisted records. A torn final line from an interrupted write is dropped.
pub fn read_teacher_records(path: &Path) -> TrainingResult<Vec<TeacherRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if i + 1 == lines.len() => {
                warn!(path = %path.display(), error = %e, "Ignoring incomplete trailing record");
            }
            Err(e) => {
                return Err(TrainingError::Dataset(format!(
                    "{}: line {}: {}",
                    path.display(),
                    i + 1,
                    e
                )));
            }
        }
    }
    Ok(records)
}

/// Cuts an interrupted final line off `path` so the next append starts on a
/// line of its own. A last record without its newline is dropped too and gets
/// regenerated.
fn truncate_torn_tail(path: &Path) -> TrainingResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = std::fs::read(path)?;
    if bytes.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    std::fs::OpenOptions::new().write(true).open(path)?.set_len(keep as u64)?;
    warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "Truncated incomplete trailing record"
    );
    Ok(())
}

pub fn completed_indices(path: &Path) -> TrainingResult<BTreeSet<usize>> {
    Ok(read_teacher_records(path)?.into_iter().map(|r| r.index).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub requested: usize,
    /// Items skipped because they were already on disk.
    pub already_done: usize,
    /// Sampling requests actually sent.
    pub issued: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Appends records to disk every `flush_every` completions and once more at close.
struct PersistenceSink {
    path: PathBuf,
    flush_every: usize,
    buffer: Vec<TeacherRecord>,
    written: usize,
}

impl PersistenceSink {
    fn new(path: PathBuf, flush_every: usize) -> Self {
        Self { path, flush_every: flush_every.max(1), buffer: Vec::new(), written: 0 }
    }

    fn push(&mut self, record: TeacherRecord) -> TrainingResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> TrainingResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut out = std::io::BufWriter::new(file);
        for record in &self.buffer {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;

        self.written += self.buffer.len();
        debug!(
            path = %self.path.display(),
            batch = self.buffer.len(),
            total = self.written,
            "Flushed teacher records"
        );
        self.buffer.clear();
        Ok(())
    }
}

pub struct BulkGenerator {
    sampler: Arc<dyn SamplingClient>,
    tokenizer: Arc<dyn Tokenizer>,
    persona: Arc<str>,
    character_name: Arc<str>,
    params: SamplingParams,
    concurrency: usize,
    flush_every: usize,
    cancel: CancellationToken,
    run_id: RunId,
    progress: Arc<dyn ProgressSink>,
}

impl BulkGenerator {
    #[must_use]
    pub fn new(
        sampler: Arc<dyn SamplingClient>,
        tokenizer: Arc<dyn Tokenizer>,
        persona: &str,
        character_name: &str,
        params: SamplingParams,
    ) -> Self {
        Self {
            sampler,
            tokenizer,
            persona: Arc::from(persona),
            character_name: Arc::from(character_name),
            params,
            concurrency: 16,
            flush_every: 10,
            cancel: CancellationToken::new(),
            run_id: RunId::new(),
            progress: Arc::new(NullProgressSink),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, concurrency: usize, flush_every: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.flush_every = flush_every.max(1);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancelling this token stops new requests; in-flight ones finish and are flushed.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Generates every item whose index is not yet in `output`.
    pub async fn run(
        &self,
        items: Vec<GenerationItem>,
        output: &Path,
    ) -> TrainingResult<GenerationReport> {
        truncate_torn_tail(output)?;
        let done = completed_indices(output)?;
        let requested = items.len();
        let pending: Vec<GenerationItem> =
            items.into_iter().filter(|it| !done.contains(&it.index)).collect();
        let already_done = requested - pending.len();
        let total = pending.len() as u64;

        info!(
            requested,
            already_done,
            remaining = pending.len(),
            concurrency = self.concurrency,
            output = %output.display(),
            "Starting teacher generation"
        );
        self.progress.on_event(ProgressEvent::Started {
            run_id: self.run_id.clone(),
            stage: Stage::Generate,
            total: Some(total),
        });

        let (tx, mut rx) = mpsc::channel::<TeacherRecord>(self.concurrency * 2);
        let writer = {
            let mut sink = PersistenceSink::new(output.to_path_buf(), self.flush_every);
            let progress = Arc::clone(&self.progress);
            let run_id = self.run_id.clone();
            tokio::spawn(async move {
                let mut received = 0u64;
                while let Some(record) = rx.recv().await {
                    sink.push(record)?;
                    received += 1;
                    progress.on_event(ProgressEvent::Items {
                        run_id: run_id.clone(),
                        stage: Stage::Generate,
                        done: received,
                        total,
                    });
                }
                sink.flush()?;
                Ok::<usize, TrainingError>(sink.written)
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut report =
            GenerationReport { requested, already_done, ..GenerationReport::default() };

        for item in pending {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| TrainingError::Other(e.into()))?
                }
            };

            let sampler = Arc::clone(&self.sampler);
            let tokenizer = Arc::clone(&self.tokenizer);
            let persona = Arc::clone(&self.persona);
            let character_name = Arc::clone(&self.character_name);
            let params = self.params.clone();
            let tx = tx.clone();
            report.issued += 1;

            tasks.spawn(async move {
                let _permit = permit;
                let index = item.index;
                let generated = generate_one(
                    item,
                    sampler.as_ref(),
                    tokenizer.as_ref(),
                    &persona,
                    &character_name,
                    &params,
                )
                .await;
                let outcome = match generated {
                    Ok(record) => tx.send(record).await.map_err(|_| {
                        TrainingError::Other(anyhow::anyhow!("writer stopped before item {index}"))
                    }),
                    Err(e) => Err(e),
                };
                outcome.map_err(|e| (index, e))
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| TrainingError::Other(e.into()))? {
                Ok(()) => report.completed += 1,
                Err((index, e)) => {
                    report.failed += 1;
                    warn!(
                        index,
                        error = %e,
                        "Teacher generation failed; item left for the next run"
                    );
                }
            }
        }

        let written = writer.await.map_err(|e| TrainingError::Other(e.into()))??;
        self.progress.on_event(ProgressEvent::Finished {
            run_id: self.run_id.clone(),
            stage: Stage::Generate,
        });
        info!(
            written,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "Teacher generation finished"
        );
        Ok(report)
    }
}

async fn generate_one(
    item: GenerationItem,
    sampler: &dyn SamplingClient,
    tokenizer: &dyn Tokenizer,
    persona: &str,
    character_name: &str,
    params: &SamplingParams,
) -> TrainingResult<TeacherRecord> {
    let full_prompt = teacher_prompt(persona, &item.question, character_name);
    let tokens = tokenizer
        .encode(&full_prompt, None)
        .context_with(|| format!("tokenizing item {}", item.index))?;
    let sampled = sampler
        .sample(&tokens, params)
        .await
        .context_with(|| format!("sampling item {}", item.index))?;
    let text = tokenizer
        .decode(&sampled)
        .context_with(|| format!("decoding item {}", item.index))?;

    Ok(TeacherRecord {
        index: item.index,
        question: item.question,
        prompt_tokens: word_count(persona),
        total_prompt_length: word_count(&full_prompt),
        full_prompt,
        teacher_response: text.trim().to_string(),
    })
}
