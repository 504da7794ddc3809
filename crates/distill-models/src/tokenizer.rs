//! Tokenizer implementations.

use distill_abstraction::{ServiceError, ServiceResult, Tokenizer};
use std::path::Path;
use tokenizers::Tokenizer as HfInner;
use tracing::debug;

/// Thin wrapper around the Hugging Face `tokenizers` crate.
///
/// Special tokens are not added on encode: the chat template already places
/// every role marker the model needs. Decoding skips special tokens.
#[derive(Debug, Clone)]
pub struct HfTokenizer {
    inner: HfInner,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// Truncation and padding configured in the file are switched off: length
    /// limits are applied by callers, always from the tail.
    pub fn from_file(path: &Path) -> ServiceResult<Self> {
        let mut inner = HfInner::from_file(path).map_err(|e| {
            ServiceError::TokenizerError(format!("{}: {}", path.display(), e))
        })?;
        inner
            .with_truncation(None)
            .map_err(|e| ServiceError::TokenizerError(e.to_string()))?;
        inner.with_padding(None);
        debug!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded from file"
        );
        Ok(Self { inner })
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, max_length: Option<usize>) -> ServiceResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ServiceError::TokenizerError(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        if let Some(max) = max_length {
            ids.truncate(max);
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[u32]) -> ServiceResult<String> {
        self.inner.decode(tokens, true).map_err(|e| ServiceError::TokenizerError(e.to_string()))
    }
}

/// Byte-level tokenizer: one token per UTF-8 byte.
///
/// Needs no vocabulary file, so it backs the mock service and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, max_length: Option<usize>) -> ServiceResult<Vec<u32>> {
        let limit = max_length.unwrap_or(usize::MAX);
        Ok(text.bytes().take(limit).map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> ServiceResult<String> {
        let bytes = tokens
            .iter()
            .map(|t| {
                u8::try_from(*t).map_err(|_| {
                    ServiceError::TokenizerError(format!("token {} is not a byte", t))
                })
            })
            .collect::<ServiceResult<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_roundtrip_and_truncation() {
        let tok = ByteTokenizer;
        let ids = tok.encode("héllo", None).unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(tok.decode(&ids).unwrap(), "héllo");
        assert_eq!(tok.encode("hello", Some(2)).unwrap(), vec![104, 101]);
    }

    #[test]
    fn test_byte_tokenizer_rejects_wide_ids() {
        assert!(ByteTokenizer.decode(&[300]).is_err());
    }

    #[test]
    fn test_hf_tokenizer_missing_file() {
        let err = HfTokenizer::from_file(Path::new("/nonexistent/tokenizer.json")).unwrap_err();
        assert!(matches!(err, ServiceError::TokenizerError(_)));
    }
}
