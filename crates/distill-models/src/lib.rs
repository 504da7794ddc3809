//! Service implementations for the distillation pipeline.
//!
//! This crate provides concrete implementations of the service traits.
//!
//! # Supported Services
//!
//! - **Mock**: In-process training service for dry runs and tests
//! - **Remote**: Hosted training service over HTTP (API key required)
//!
//! # Tokenizers
//!
//! - **HfTokenizer**: Hugging Face `tokenizer.json`
//! - **ByteTokenizer**: One token per byte, no vocabulary needed

pub mod factory;
pub mod remote;
pub mod tokenizer;

use async_trait::async_trait;
use distill_abstraction::{
    AdamParams, CheckpointRef, ForwardBackwardOutput, LossFnOutput, LossKind, OptimStepAck,
    Pending, SamplingClient, SamplingParams, ServiceError, ServiceProvider, ServiceResult,
    TrainingService, TrainingTensor,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub use factory::{ServiceFactory, ServiceKind, ServiceSettings};
pub use remote::{RemoteSampler, RemoteServiceClient, RemoteTrainingSession};
pub use tokenizer::{ByteTokenizer, HfTokenizer};

#[derive(Debug, Default)]
struct MockState {
    /// Optimizer steps applied so far.
    steps: u64,
    next_request: u64,
}

/// Checkpoint name -> step it was saved at. Shared by every session of one provider.
type CheckpointStore = Arc<Mutex<BTreeMap<String, u64>>>;

/// A mock implementation of `TrainingService` for testing and dry runs.
///
/// Log-probabilities rise toward zero as optimizer steps accumulate, so the
/// reported loss falls the way a real run's would.
#[derive(Debug, Clone)]
pub struct MockTrainingService {
    base_model: String,
    state: Arc<Mutex<MockState>>,
    checkpoints: CheckpointStore,
}

impl MockTrainingService {
    /// Creates a new `MockTrainingService` for the given base model.
    #[must_use]
    pub fn new(base_model: String) -> Self {
        Self::with_store(base_model, CheckpointStore::default())
    }

    fn with_store(base_model: String, checkpoints: CheckpointStore) -> Self {
        Self { base_model, state: Arc::new(Mutex::new(MockState::default())), checkpoints }
    }

    /// Optimizer steps applied so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.state.lock().map(|s| s.steps).unwrap_or_default()
    }

    /// Names of all saved checkpoints.
    #[must_use]
    pub fn checkpoint_names(&self) -> Vec<String> {
        self.checkpoints.lock().map(|c| c.keys().cloned().collect()).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> ServiceResult<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| ServiceError::Other("mock state poisoned".to_string()))?;
        Ok(f(&mut guard))
    }

    fn with_checkpoints<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, u64>) -> T,
    ) -> ServiceResult<T> {
        let mut guard = self
            .checkpoints
            .lock()
            .map_err(|_| ServiceError::Other("mock checkpoint store poisoned".to_string()))?;
        Ok(f(&mut guard))
    }

    fn next_request_id(state: &mut MockState, kind: &str) -> String {
        state.next_request += 1;
        format!("mock-{}-{}", kind, state.next_request)
    }
}

#[async_trait]
impl TrainingService for MockTrainingService {
    async fn submit_forward_backward(
        &self,
        batch: &[TrainingTensor],
        loss: LossKind,
    ) -> ServiceResult<Pending<ForwardBackwardOutput>> {
        let (request_id, steps) =
            self.with_state(|s| (Self::next_request_id(s, "fwdbwd"), s.steps))?;
        debug!(
            request_id = %request_id,
            batch = batch.len(),
            loss = loss.as_str(),
            "MockTrainingService forward_backward"
        );

        let logprob = -2.0 / (1.0 + 0.05 * steps as f32);
        let output = ForwardBackwardOutput {
            loss_fn_outputs: batch
                .iter()
                .map(|t| LossFnOutput { logprobs: vec![logprob; t.len()] })
                .collect(),
        };
        Ok(Pending::ready(request_id, Ok(output)))
    }

    async fn submit_optimizer_step(
        &self,
        params: &AdamParams,
    ) -> ServiceResult<Pending<OptimStepAck>> {
        let request_id = self.with_state(|s| {
            s.steps += 1;
            Self::next_request_id(s, "optim")
        })?;
        debug!(
            request_id = %request_id,
            lr = params.learning_rate,
            "MockTrainingService optim_step"
        );

        let mut metrics = BTreeMap::new();
        metrics.insert("learning_rate".to_string(), params.learning_rate);
        Ok(Pending::ready(request_id, Ok(OptimStepAck { metrics })))
    }

    async fn save_checkpoint(&self, name: &str) -> ServiceResult<CheckpointRef> {
        let steps = self.with_state(|s| s.steps)?;
        self.with_checkpoints(|c| {
            c.insert(name.to_string(), steps);
        })?;
        Ok(CheckpointRef {
            name: name.to_string(),
            path: format!("mock://{}/{}", self.base_model, name),
        })
    }

    async fn load_checkpoint(&self, name: &str) -> ServiceResult<()> {
        let step = self
            .with_checkpoints(|c| c.get(name).copied())?
            .ok_or_else(|| ServiceError::NotFound(format!("checkpoint '{}'", name)))?;
        self.with_state(|s| s.steps = step)
    }

    async fn get_inference_handle(&self, name: &str) -> ServiceResult<Arc<dyn SamplingClient>> {
        self.save_checkpoint(name).await?;
        Ok(Arc::new(MockSampler::new(name.to_string())))
    }

    fn base_model(&self) -> &str {
        &self.base_model
    }
}

/// A mock sampler that echoes the tail of its prompt.
#[derive(Debug, Clone, Default)]
pub struct MockSampler {
    id: String,
}

impl MockSampler {
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl SamplingClient for MockSampler {
    async fn sample(
        &self,
        prompt_tokens: &[u32],
        params: &SamplingParams,
    ) -> ServiceResult<Vec<u32>> {
        let take = (params.max_tokens as usize).min(prompt_tokens.len());
        debug!(model_id = %self.id, prompt_len = prompt_tokens.len(), take, "MockSampler sampling");
        Ok(prompt_tokens[prompt_tokens.len() - take..].to_vec())
    }

    fn model_id(&self) -> &str {
        &self.id
    }
}

/// Provider handing out mock sessions and samplers.
///
/// Sessions from one provider share a checkpoint store, so a checkpoint saved
/// by a training session can be loaded by a later evaluation session.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    checkpoints: CheckpointStore,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceProvider for MockProvider {
    async fn create_training_session(
        &self,
        base_model: &str,
        lora_rank: u32,
    ) -> ServiceResult<Box<dyn TrainingService>> {
        debug!(base_model, lora_rank, "MockProvider creating training session");
        let store = Arc::clone(&self.checkpoints);
        Ok(Box::new(MockTrainingService::with_store(base_model.to_string(), store)))
    }

    fn sampling_client(&self, base_model: &str) -> ServiceResult<Arc<dyn SamplingClient>> {
        Ok(Arc::new(MockSampler::new(base_model.to_string())))
    }
}
