//! Example records and the converter from raw teacher output to student conversations.
//!
//! Raw records arrive as loose JSONL in a few shapes (`{question, response}`,
//! `{prompt, output}`, or generated `{question, teacher_response, ...}`). They
//! are parsed into [`RawExample`] at the file boundary and converted into
//! two-turn [`ConversationExample`]s that carry no persona text.

use crate::error::{DataQualityError, TrainingError, TrainingResult};
use crate::template::word_count;
use distill_abstraction::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One raw teacher record, as produced by data preparation or bulk generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExample {
    #[serde(rename = "question", alias = "prompt", alias = "prompt_or_question")]
    pub prompt_or_question: String,
    #[serde(alias = "output", alias = "teacher_response")]
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl RawExample {
    #[must_use]
    pub fn new(question: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt_or_question: question.into(),
            response: response.into(),
            source: None,
            index: None,
        }
    }
}

/// A user turn followed by an assistant turn.
///
/// The assistant turn is always last; it is the only region the loss covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConversationRecord")]
pub struct ConversationExample {
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ConversationRecord {
    messages: Vec<ChatMessage>,
}

impl TryFrom<ConversationRecord> for ConversationExample {
    type Error = DataQualityError;

    fn try_from(record: ConversationRecord) -> Result<Self, Self::Error> {
        Self::from_messages(record.messages)
    }
}

impl ConversationExample {
    #[must_use]
    pub fn new(question: impl Into<String>, response: impl Into<String>) -> Self {
        Self { messages: vec![ChatMessage::user(question), ChatMessage::assistant(response)] }
    }

    /// Validates an untyped message list.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Result<Self, DataQualityError> {
        match messages.as_slice() {
            [] => Err(DataQualityError::EmptyConversation),
            [user, assistant] if user.role == Role::User && assistant.role == Role::Assistant => {
                Ok(Self { messages })
            }
            [..] => Err(DataQualityError::MalformedConversation(format!(
                "expected [user, assistant], got [{}]",
                messages.iter().map(|m| m.role.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn question(&self) -> &str {
        &self.messages[0].content
    }

    #[must_use]
    pub fn response(&self) -> &str {
        &self.messages[1].content
    }
}

/// How the user turn is taken from a raw prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptExtraction {
    /// The whole prompt, unchanged.
    #[default]
    Verbatim,
    /// The last non-empty line of a multi-line role-play prompt. Single-line
    /// prompts carry no question line and become [`SINGLE_LINE_QUESTION`].
    LastLine,
}

/// User turn for a single-line prompt under [`PromptExtraction::LastLine`].
pub const SINGLE_LINE_QUESTION: &str = "User question";

impl PromptExtraction {
    fn apply(self, prompt: &str) -> &str {
        match self {
            Self::Verbatim => prompt,
            Self::LastLine if !prompt.trim().contains('\n') => SINGLE_LINE_QUESTION,
            Self::LastLine => prompt
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or(SINGLE_LINE_QUESTION),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConverterOptions {
    pub min_response_words: usize,
    pub extraction: PromptExtraction,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self { min_response_words: 20, extraction: PromptExtraction::Verbatim }
    }
}

/// Converts one raw record, applying the response quality filter.
pub fn convert_example(
    raw: &RawExample,
    options: &ConverterOptions,
) -> Result<ConversationExample, DataQualityError> {
    if raw.response.trim().is_empty() {
        return Err(DataQualityError::EmptyResponse);
    }
    let words = word_count(&raw.response);
    if words < options.min_response_words {
        return Err(DataQualityError::ResponseTooShort {
            words,
            min_words: options.min_response_words,
        });
    }
    let question = options.extraction.apply(&raw.prompt_or_question);
    Ok(ConversationExample::new(question, raw.response.clone()))
}

/// Outcome of converting a batch of raw records.
#[derive(Debug, Clone, Default)]
pub struct ConversionReport {
    pub examples: Vec<ConversationExample>,
    pub skipped_empty: usize,
    pub skipped_too_short: usize,
}

impl ConversionReport {
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped_empty + self.skipped_too_short
    }
}

/// Converts every record, skipping (and counting) the ones that fail the filter.
pub fn convert_all(raws: &[RawExample], options: &ConverterOptions) -> ConversionReport {
    let mut report = ConversionReport::default();
    for (idx, raw) in raws.iter().enumerate() {
        match convert_example(raw, options) {
            Ok(ex) => report.examples.push(ex),
            Err(DataQualityError::EmptyResponse) => {
                debug!(idx, "Skipping record with empty response");
                report.skipped_empty += 1;
            }
            Err(e) => {
                debug!(idx, reason = %e, "Skipping record");
                report.skipped_too_short += 1;
            }
        }
    }
    if report.skipped() > 0 {
        warn!(
            skipped_empty = report.skipped_empty,
            skipped_too_short = report.skipped_too_short,
            kept = report.examples.len(),
            "Filtered raw records"
        );
    }
    report
}

pub(crate) fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> TrainingResult<Vec<T>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| {
            let line_no = idx + 1;
            TrainingError::Dataset(format!(
                "{}: failed to parse jsonl line {line_no}: {e}",
                path.display()
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

pub fn read_raw_examples(path: &Path) -> TrainingResult<Vec<RawExample>> {
    let records = read_jsonl(path)?;
    info!(path = %path.display(), count = records.len(), "Loaded raw examples");
    Ok(records)
}

pub fn read_conversations(path: &Path) -> TrainingResult<Vec<ConversationExample>> {
    let records = read_jsonl(path)?;
    info!(path = %path.display(), count = records.len(), "Loaded conversation examples");
    Ok(records)
}

/// Writes one `{"messages": [...]}` object per line.
pub fn write_conversations(path: &Path, examples: &[ConversationExample]) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for ex in examples {
        serde_json::to_writer(&mut out, ex)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

pub fn compute_dataset_id(examples: &[ConversationExample]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for ex in examples {
        let bytes = serde_json::to_vec(ex)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn words(n: usize) -> String {
        vec!["note"; n].join(" ")
    }

    #[test]
    fn test_ten_records_two_short_yield_eight() {
        let mut raws: Vec<RawExample> =
            (0..8).map(|i| RawExample::new(format!("q{i}"), words(25))).collect();
        raws.push(RawExample::new("short", words(19)));
        raws.push(RawExample::new("shorter", "Yes."));

        let report = convert_all(&raws, &ConverterOptions::default());
        assert_eq!(report.examples.len(), 8);
        assert_eq!(report.skipped_too_short, 2);
    }

    #[test]
    fn test_convert_is_verbatim() {
        let raw = RawExample::new("  Who are you?\n", format!("  {}  ", words(20)));
        let ex = convert_example(&raw, &ConverterOptions::default()).unwrap();
        assert_eq!(ex.question(), "  Who are you?\n");
        assert_eq!(ex.response(), raw.response);
    }

    #[test]
    fn test_empty_response_is_counted_separately() {
        let report = convert_all(&[RawExample::new("q", "   ")], &ConverterOptions::default());
        assert_eq!(report.skipped_empty, 1);
        assert!(report.examples.is_empty());
    }

    #[test]
    fn test_last_line_extraction() {
        let raw = RawExample::new(
            "I want you to act like Beethoven.\n\nUser: Tell me of Vienna.\n",
            words(20),
        );
        let options =
            ConverterOptions { extraction: PromptExtraction::LastLine, ..Default::default() };
        assert_eq!(convert_example(&raw, &options).unwrap().question(), "User: Tell me of Vienna.");

        let single = RawExample::new("I want you to act like Beethoven.\n", words(20));
        assert_eq!(convert_example(&single, &options).unwrap().question(), SINGLE_LINE_QUESTION);
    }

    #[test]
    fn test_raw_example_aliases() {
        let a: RawExample = serde_json::from_str(r#"{"prompt":"p","output":"o"}"#).unwrap();
        let b: RawExample = serde_json::from_str(
            r#"{"index":3,"question":"p","teacher_response":"o","full_prompt":"x"}"#,
        )
        .unwrap();
        assert_eq!(a.prompt_or_question, "p");
        assert_eq!(b.response, "o");
        assert_eq!(b.index, Some(3));
    }

    #[test]
    fn test_conversation_rejects_wrong_roles() {
        let res: Result<ConversationExample, _> = serde_json::from_str(
            r#"{"messages":[{"role":"assistant","content":"a"},{"role":"user","content":"q"}]}"#,
        );
        assert!(res.is_err());
        assert_eq!(
            ConversationExample::from_messages(vec![]),
            Err(DataQualityError::EmptyConversation)
        );
    }

    #[test]
    fn test_conversations_jsonl_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        let examples = vec![ConversationExample::new("q", "a")];
        write_conversations(&path, &examples).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"messages":[{"role":"user","content":"q"},"#,
                r#"{"role":"assistant","content":"a"}]}"#,
                "\n"
            )
        );
        assert_eq!(read_conversations(&path).unwrap(), examples);
    }

    #[test]
    fn test_dataset_id_stable_and_content_sensitive() {
        let a = vec![ConversationExample::new("q", "a")];
        let b = vec![ConversationExample::new("q", "b")];
        assert_eq!(compute_dataset_id(&a).unwrap(), compute_dataset_id(&a).unwrap());
        assert_ne!(compute_dataset_id(&a).unwrap(), compute_dataset_id(&b).unwrap());
    }
}
