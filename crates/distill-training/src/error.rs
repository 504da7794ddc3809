use distill_abstraction::{ServiceError, ShapeMismatch};
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Per-example data problems. These are filtered and counted, never fatal to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataQualityError {
    #[error("response is empty")]
    EmptyResponse,

    #[error("response has {words} words, need at least {min_words}")]
    ResponseTooShort { words: usize, min_words: usize },

    #[error("no trainable region: prompt prefix is {prefix_len} tokens, sequence is {total_len}")]
    NoTrainableRegion { prefix_len: usize, total_len: usize },

    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),

    #[error("conversation has no turns")]
    EmptyConversation,

    #[error("malformed conversation: {0}")]
    MalformedConversation(String),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("data quality: {0}")]
    DataQuality(#[from] DataQualityError),

    #[error("service error during {context}: {source}")]
    Service {
        context: String,
        #[source]
        source: ServiceError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Wraps a service failure with the unit of work it aborted.
    pub fn service(context: impl Into<String>, source: ServiceError) -> Self {
        Self::Service { context: context.into(), source }
    }

    /// True for per-example problems that callers skip rather than abort on.
    #[must_use]
    pub fn is_data_quality(&self) -> bool {
        matches!(self, Self::DataQuality(_))
    }
}

/// Attaches context to a service result.
pub trait ServiceContext<T> {
    fn context_with(self, context: impl FnOnce() -> String) -> TrainingResult<T>;
}

impl<T> ServiceContext<T> for Result<T, ServiceError> {
    fn context_with(self, context: impl FnOnce() -> String) -> TrainingResult<T> {
        self.map_err(|e| TrainingError::service(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_carries_context() {
        let res: Result<(), ServiceError> = Err(ServiceError::NotFound("ckpt".into()));
        let err = res.context_with(|| "step 12 forward_backward".to_string()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "service error during step 12 forward_backward: Not Found: ckpt"
        );
        assert!(!err.is_data_quality());
    }

    #[test]
    fn test_data_quality_from() {
        let err: TrainingError = DataQualityError::EmptyResponse.into();
        assert!(err.is_data_quality());
    }
}
