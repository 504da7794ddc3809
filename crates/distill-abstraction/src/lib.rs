//! Service abstraction layer for the distillation pipeline.
//!
//! This module defines the traits and wire-level types the pipeline uses to
//! talk to its external collaborators: the tokenizer, the remote training
//! service, and sampling (inference) endpoints. The pipeline owns token
//! sequences, masks, and checkpoint names; model weights never cross this
//! boundary.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Represents an error that can occur when interacting with an external service.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceError {
    /// The request could not be sent (network issues, connection refused).
    #[error("Request Error: {0}")]
    RequestError(String),

    /// The service answered with a non-success status.
    #[error("Service Response Error ({status}): {body}")]
    ResponseError {
        /// HTTP status code returned by the service.
        status: u16,
        /// Response body, as returned.
        body: String,
    },

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    SerializationError(String),

    /// A pipelined request was accepted but later failed on the service side.
    #[error("Request '{request_id}' failed: {message}")]
    RequestFailed {
        /// Identifier of the accepted request.
        request_id: String,
        /// Failure reason reported by the service.
        message: String,
    },

    /// A named resource (checkpoint, session) does not exist.
    #[error("Not Found: {0}")]
    NotFound(String),

    /// The client is missing a credential or setting.
    #[error("Configuration Error: {0}")]
    ConfigError(String),

    /// The tokenizer rejected the input or failed to load.
    #[error("Tokenizer Error: {0}")]
    TokenizerError(String),

    /// Other unexpected errors.
    #[error("Other Service Error: {0}")]
    Other(String),
}

/// Result alias used across the service seam.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// The asking party.
    User,
    /// The answering party; the only role the loss is computed over.
    Assistant,
}

impl Role {
    /// Returns the lowercase tag used in chat templates and JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender.
    pub role: Role,
    /// The content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Lengths of a tensor's three sequences when they disagree.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tensor lengths differ: input={input}, target={target}, weights={weights}")]
pub struct ShapeMismatch {
    /// Length of `input_tokens`.
    pub input: usize,
    /// Length of `target_tokens`.
    pub target: usize,
    /// Length of `loss_weights`.
    pub weights: usize,
}

/// One supervised training example in next-token form.
///
/// `input_tokens[i]` predicts `target_tokens[i]`, and `loss_weights[i]` gates
/// that prediction. The three sequences always have the same length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingTensor {
    input_tokens: Vec<u32>,
    target_tokens: Vec<u32>,
    loss_weights: Vec<f32>,
}

impl TrainingTensor {
    /// Builds a tensor, rejecting sequences of unequal length.
    pub fn new(
        input_tokens: Vec<u32>,
        target_tokens: Vec<u32>,
        loss_weights: Vec<f32>,
    ) -> Result<Self, ShapeMismatch> {
        if input_tokens.len() != target_tokens.len() || target_tokens.len() != loss_weights.len() {
            return Err(ShapeMismatch {
                input: input_tokens.len(),
                target: target_tokens.len(),
                weights: loss_weights.len(),
            });
        }
        Ok(Self { input_tokens, target_tokens, loss_weights })
    }

    #[must_use]
    pub fn input_tokens(&self) -> &[u32] {
        &self.input_tokens
    }

    #[must_use]
    pub fn target_tokens(&self) -> &[u32] {
        &self.target_tokens
    }

    #[must_use]
    pub fn loss_weights(&self) -> &[f32] {
        &self.loss_weights
    }

    /// Number of positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_empty()
    }

    /// Sum of all loss weights.
    #[must_use]
    pub fn weight_sum(&self) -> f64 {
        self.loss_weights.iter().map(|w| f64::from(*w)).sum()
    }
}

/// Loss function requested from the training service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Token-level cross entropy weighted by `loss_weights`.
    #[default]
    CrossEntropy,
}

impl LossKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CrossEntropy => "cross_entropy",
        }
    }
}

/// Adam optimizer hyperparameters for one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self { learning_rate: 1e-4, beta1: 0.9, beta2: 0.95, eps: 1e-8 }
    }
}

/// Per-example output of a forward-backward pass.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LossFnOutput {
    /// Log-probability of each target token, aligned with `target_tokens`.
    pub logprobs: Vec<f32>,
}

/// Result of a forward-backward request, one entry per batch example.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ForwardBackwardOutput {
    pub loss_fn_outputs: Vec<LossFnOutput>,
}

/// Acknowledgement that an optimizer step was applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OptimStepAck {
    /// Optional service-side metrics (e.g. gradient norm).
    #[serde(default)]
    pub metrics: std::collections::BTreeMap<String, f64>,
}

/// Handle to a checkpoint held by the training service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    /// The name the checkpoint was saved under.
    pub name: String,
    /// Service-side locator (opaque to the pipeline).
    pub path: String,
}

/// Parameters for controlling generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional stop sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { max_tokens: 300, temperature: 0.7, stop: None }
    }
}

/// A request that the service has accepted but whose result may not be ready.
///
/// Submitting returns once the service has the request; awaiting the handle
/// waits for the result. This split is what lets a caller put several
/// dependent requests in flight before waiting on any of them.
pub struct Pending<T> {
    request_id: String,
    inner: BoxFuture<'static, ServiceResult<T>>,
}

impl<T: Send + 'static> Pending<T> {
    /// Wraps a future that resolves to the request's result.
    pub fn new<F>(request_id: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = ServiceResult<T>> + Send + 'static,
    {
        Self { request_id: request_id.into(), inner: fut.boxed() }
    }

    /// A request whose result is already known.
    pub fn ready(request_id: impl Into<String>, value: ServiceResult<T>) -> Self {
        Self::new(request_id, futures::future::ready(value))
    }
}

impl<T> Pending<T> {
    /// Identifier the service assigned to this request.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the request to complete.
    pub async fn result(self) -> ServiceResult<T> {
        self.inner.await
    }
}

impl<T> IntoFuture for Pending<T> {
    type Output = ServiceResult<T>;
    type IntoFuture = BoxFuture<'static, ServiceResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("request_id", &self.request_id).finish_non_exhaustive()
    }
}

/// Maps text to token ids and back.
///
/// Implementations must be stable: the same text always yields the same
/// tokens, otherwise loss masks are not reproducible.
pub trait Tokenizer: Send + Sync {
    /// Encodes `text`, keeping at most `max_length` leading tokens when given.
    fn encode(&self, text: &str, max_length: Option<usize>) -> ServiceResult<Vec<u32>>;

    /// Decodes token ids into text.
    fn decode(&self, tokens: &[u32]) -> ServiceResult<String>;

    /// Number of tokens `text` encodes to.
    fn count_tokens(&self, text: &str) -> ServiceResult<usize> {
        Ok(self.encode(text, None)?.len())
    }
}

/// An inference endpoint bound to a fixed set of weights.
#[async_trait]
pub trait SamplingClient: Send + Sync {
    /// Generates one completion for `prompt_tokens` and returns its token ids.
    async fn sample(
        &self,
        prompt_tokens: &[u32],
        params: &SamplingParams,
    ) -> ServiceResult<Vec<u32>>;

    /// Returns the identifier of the weights this client samples from.
    fn model_id(&self) -> &str;
}

/// A stateful training session on the remote service.
///
/// A session is exclusively owned by one orchestrator; implementations are
/// not expected to coordinate concurrent writers.
#[async_trait]
pub trait TrainingService: Send + Sync {
    /// Submits a forward-backward pass over `batch` without waiting for it.
    async fn submit_forward_backward(
        &self,
        batch: &[TrainingTensor],
        loss: LossKind,
    ) -> ServiceResult<Pending<ForwardBackwardOutput>>;

    /// Submits an optimizer step without waiting for it.
    ///
    /// The service applies it against the gradients of the most recently
    /// submitted forward-backward pass.
    async fn submit_optimizer_step(
        &self,
        params: &AdamParams,
    ) -> ServiceResult<Pending<OptimStepAck>>;

    /// Saves the full training state under `name`.
    async fn save_checkpoint(&self, name: &str) -> ServiceResult<CheckpointRef>;

    /// Restores the training state saved under `name`.
    async fn load_checkpoint(&self, name: &str) -> ServiceResult<()>;

    /// Saves the current weights under `name` and returns a client that samples from them.
    async fn get_inference_handle(&self, name: &str) -> ServiceResult<Arc<dyn SamplingClient>>;

    /// The base model this session fine-tunes.
    fn base_model(&self) -> &str;
}

/// Entry point to a training/inference service.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Opens a new training session with a low-rank adapter of `lora_rank`.
    async fn create_training_session(
        &self,
        base_model: &str,
        lora_rank: u32,
    ) -> ServiceResult<Box<dyn TrainingService>>;

    /// Returns a sampling client for an unmodified base model.
    fn sampling_client(&self, base_model: &str) -> ServiceResult<Arc<dyn SamplingClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_tensor_rejects_unequal_lengths() {
        let err = TrainingTensor::new(vec![1, 2], vec![2, 3], vec![1.0]).unwrap_err();
        assert_eq!(err, ShapeMismatch { input: 2, target: 2, weights: 1 });
    }

    #[test]
    fn test_training_tensor_weight_sum() {
        let t = TrainingTensor::new(vec![1, 2, 3], vec![2, 3, 4], vec![0.0, 1.0, 1.0]).unwrap();
        assert_eq!(t.len(), 3);
        assert!((t.weight_sum() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_service_error_display() {
        let err = ServiceError::RequestFailed { request_id: "r1".into(), message: "boom".into() };
        assert_eq!(err.to_string(), "Request 'r1' failed: boom");
    }

    #[tokio::test]
    async fn test_pending_ready_resolves() {
        let pending = Pending::ready("req-1", Ok(7_u32));
        assert_eq!(pending.request_id(), "req-1");
        assert_eq!(pending.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_pending_result_propagates_error() {
        let pending: Pending<u32> = Pending::ready("req-2", Err(ServiceError::Other("x".into())));
        assert!(pending.result().await.is_err());
    }
}
