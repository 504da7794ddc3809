//! Remote training service client.
//!
//! Talks JSON over HTTP to a hosted fine-tuning service. Requests that may
//! take a while (`forward_backward`, `optim_step`, `sample`) are accepted
//! immediately with a `request_id`; the result is then fetched by polling
//! `retrieve_future`. Submitting and awaiting are separate so the caller can
//! keep several requests in flight.
//!
//! # Constructor Patterns
//!
//! - `new()` - Loads the API key from `DISTILL_API_KEY`
//! - `from_env()` - Loads the API key from a named environment variable
//! - `with_api_key()` - Explicit API key

use async_trait::async_trait;
use distill_abstraction::{
    AdamParams, CheckpointRef, ForwardBackwardOutput, LossFnOutput, LossKind, OptimStepAck,
    Pending, SamplingClient, SamplingParams, ServiceError, ServiceProvider, ServiceResult,
    TrainingService, TrainingTensor,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Default environment variable holding the service API key.
pub const DEFAULT_API_KEY_ENV: &str = "DISTILL_API_KEY";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared HTTP plumbing for every remote handle.
#[derive(Debug, Clone)]
struct ApiClient {
    base_url: String,
    api_key: String,
    client: Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl ApiClient {
    async fn post<B, R>(&self, path: &str, body: &B) -> ServiceResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!(url = %url, "POST to training service");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Failed to send request to training service");
                ServiceError::RequestError(format!("Network error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                status = %status,
                error = %body,
                url = %url,
                "Training service returned error status"
            );

            if status == StatusCode::NOT_FOUND {
                return Err(ServiceError::NotFound(body));
            }
            return Err(ServiceError::ResponseError { status: status.as_u16(), body });
        }

        response.json::<R>().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to parse training service response");
            ServiceError::SerializationError(format!("Failed to parse response: {}", e))
        })
    }

    /// Submits a request that completes asynchronously on the service side.
    async fn submit<B, R>(&self, path: &str, body: &B) -> ServiceResult<Pending<R>>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send + 'static,
    {
        let accepted: AcceptedResponse = self.post(path, body).await?;
        let request_id = accepted.request_id;
        debug!(request_id = %request_id, path, "Request accepted");

        let api = self.clone();
        let id = request_id.clone();
        Ok(Pending::new(request_id, async move { api.retrieve::<R>(id).await }))
    }

    /// Polls `retrieve_future` until the request completes or fails.
    async fn retrieve<R: DeserializeOwned>(&self, request_id: String) -> ServiceResult<R> {
        let body = RetrieveRequest { request_id: &request_id };
        let poll = async {
            loop {
                let state: FutureState = self.post("retrieve_future", &body).await?;
                match state.status {
                    FutureStatus::Pending => tokio::time::sleep(self.poll_interval).await,
                    FutureStatus::Complete => {
                        let value = state.result.unwrap_or(serde_json::Value::Null);
                        return serde_json::from_value::<R>(value).map_err(|e| {
                            ServiceError::SerializationError(format!(
                                "Failed to decode result of '{}': {}",
                                request_id, e
                            ))
                        });
                    }
                    FutureStatus::Failed => {
                        return Err(ServiceError::RequestFailed {
                            request_id: request_id.clone(),
                            message: state.error.unwrap_or_else(|| "unknown failure".to_string()),
                        });
                    }
                }
            }
        };

        tokio::time::timeout(self.request_timeout, poll).await.map_err(|_| {
            error!(request_id = %request_id, "Timed out waiting for request result");
            ServiceError::RequestError(format!(
                "Timed out after {:?} waiting for '{}'",
                self.request_timeout, request_id
            ))
        })?
    }
}

/// Client for the hosted training service.
#[derive(Debug, Clone)]
pub struct RemoteServiceClient {
    api: ApiClient,
}

impl RemoteServiceClient {
    /// Creates a client, reading the API key from `DISTILL_API_KEY`.
    ///
    /// # Errors
    /// Returns `ServiceError::ConfigError` if the variable is not set.
    pub fn new(base_url: String) -> Result<Self, ServiceError> {
        Self::from_env(base_url, DEFAULT_API_KEY_ENV)
    }

    /// Creates a client, reading the API key from the environment variable `key_var`.
    #[allow(clippy::disallowed_methods)] // env::var is needed for API key loading
    pub fn from_env(base_url: String, key_var: &str) -> Result<Self, ServiceError> {
        let api_key = env::var(key_var).map_err(|_| {
            ServiceError::ConfigError(format!("{} environment variable not set", key_var))
        })?;
        Ok(Self::with_api_key(base_url, api_key))
    }

    /// Creates a client with an explicit API key.
    #[must_use]
    pub fn with_api_key(base_url: String, api_key: String) -> Self {
        Self {
            api: ApiClient {
                base_url,
                api_key,
                client: Client::builder()
                    .timeout(Duration::from_secs(120))
                    .build()
                    .unwrap_or_else(|_| Client::new()),
                poll_interval: DEFAULT_POLL_INTERVAL,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
            },
        }
    }

    /// Sets how often pending requests are polled.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.api.poll_interval = interval;
        self
    }

    /// Sets the total time allowed for one pending request to finish.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.api.request_timeout = timeout;
        self
    }

    /// Opens a training session and returns the concrete handle.
    pub async fn open_session(
        &self,
        base_model: &str,
        lora_rank: u32,
    ) -> ServiceResult<RemoteTrainingSession> {
        let created: SessionCreated = self
            .api
            .post("create_session", &CreateSessionRequest { base_model, lora_rank })
            .await?;
        debug!(session_id = %created.session_id, base_model, lora_rank, "Training session created");
        Ok(RemoteTrainingSession {
            api: self.api.clone(),
            session_id: created.session_id,
            base_model: base_model.to_string(),
        })
    }
}

#[async_trait]
impl ServiceProvider for RemoteServiceClient {
    async fn create_training_session(
        &self,
        base_model: &str,
        lora_rank: u32,
    ) -> ServiceResult<Box<dyn TrainingService>> {
        Ok(Box::new(self.open_session(base_model, lora_rank).await?))
    }

    fn sampling_client(&self, base_model: &str) -> ServiceResult<Arc<dyn SamplingClient>> {
        Ok(Arc::new(RemoteSampler {
            api: self.api.clone(),
            target: SampleTarget::BaseModel(base_model.to_string()),
        }))
    }
}

/// A training session held open on the service.
#[derive(Debug)]
pub struct RemoteTrainingSession {
    api: ApiClient,
    session_id: String,
    base_model: String,
}

impl RemoteTrainingSession {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl TrainingService for RemoteTrainingSession {
    async fn submit_forward_backward(
        &self,
        batch: &[TrainingTensor],
        loss: LossKind,
    ) -> ServiceResult<Pending<ForwardBackwardOutput>> {
        let body = ForwardBackwardRequest {
            session_id: &self.session_id,
            data: batch.iter().map(WireDatum::from_tensor).collect(),
            loss_fn: loss.as_str(),
        };
        let pending: Pending<WireForwardBackward> =
            self.api.submit("forward_backward", &body).await?;
        let request_id = pending.request_id().to_string();
        Ok(Pending::new(request_id, async move {
            pending.await.map(WireForwardBackward::into_output)
        }))
    }

    async fn submit_optimizer_step(
        &self,
        params: &AdamParams,
    ) -> ServiceResult<Pending<OptimStepAck>> {
        let body = OptimStepRequest { session_id: &self.session_id, adam_params: params };
        self.api.submit("optim_step", &body).await
    }

    async fn save_checkpoint(&self, name: &str) -> ServiceResult<CheckpointRef> {
        let saved: SavedPath = self
            .api
            .post("save_state", &NamedRequest { session_id: &self.session_id, name })
            .await?;
        Ok(CheckpointRef { name: name.to_string(), path: saved.path })
    }

    async fn load_checkpoint(&self, name: &str) -> ServiceResult<()> {
        let _: serde_json::Value = self
            .api
            .post("load_state", &NamedRequest { session_id: &self.session_id, name })
            .await?;
        Ok(())
    }

    async fn get_inference_handle(&self, name: &str) -> ServiceResult<Arc<dyn SamplingClient>> {
        let saved: SavedPath = self
            .api
            .post("save_weights_for_sampler", &NamedRequest { session_id: &self.session_id, name })
            .await?;
        Ok(Arc::new(RemoteSampler {
            api: self.api.clone(),
            target: SampleTarget::Weights { name: name.to_string(), path: saved.path },
        }))
    }

    fn base_model(&self) -> &str {
        &self.base_model
    }
}

#[derive(Debug, Clone)]
enum SampleTarget {
    BaseModel(String),
    Weights { name: String, path: String },
}

/// Samples from either a base model or saved fine-tuned weights.
#[derive(Debug, Clone)]
pub struct RemoteSampler {
    api: ApiClient,
    target: SampleTarget,
}

#[async_trait]
impl SamplingClient for RemoteSampler {
    async fn sample(
        &self,
        prompt_tokens: &[u32],
        params: &SamplingParams,
    ) -> ServiceResult<Vec<u32>> {
        let (base_model, model_path) = match &self.target {
            SampleTarget::BaseModel(model) => (Some(model.as_str()), None),
            SampleTarget::Weights { path, .. } => (None, Some(path.as_str())),
        };
        let body = SampleRequest {
            base_model,
            model_path,
            prompt: WireModelInput::from_tokens(prompt_tokens),
            sampling_params: params,
            num_samples: 1,
        };
        let pending: Pending<WireSampleResult> = self.api.submit("sample", &body).await?;
        let request_id = pending.request_id().to_string();
        let result = pending.await?;
        result.sequences.into_iter().next().map(|s| s.tokens).ok_or_else(|| {
            ServiceError::RequestFailed { request_id, message: "no sequences returned".to_string() }
        })
    }

    fn model_id(&self) -> &str {
        match &self.target {
            SampleTarget::BaseModel(model) => model,
            SampleTarget::Weights { name, .. } => name,
        }
    }
}

// Service API request/response structures

#[derive(Debug, Deserialize)]
struct AcceptedResponse {
    request_id: String,
}

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    request_id: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FutureStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Deserialize)]
struct FutureState {
    status: FutureStatus,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    base_model: &'a str,
    lora_rank: u32,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ForwardBackwardRequest<'a> {
    session_id: &'a str,
    data: Vec<WireDatum>,
    loss_fn: &'static str,
}

#[derive(Debug, Serialize)]
struct OptimStepRequest<'a> {
    session_id: &'a str,
    adam_params: &'a AdamParams,
}

#[derive(Debug, Serialize)]
struct NamedRequest<'a> {
    session_id: &'a str,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct SavedPath {
    path: String,
}

#[derive(Debug, Serialize)]
struct SampleRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_path: Option<&'a str>,
    prompt: WireModelInput,
    sampling_params: &'a SamplingParams,
    num_samples: u32,
}

#[derive(Debug, Deserialize)]
struct WireSampleResult {
    sequences: Vec<WireSequence>,
}

#[derive(Debug, Deserialize)]
struct WireSequence {
    tokens: Vec<u32>,
}

/// One training example as the service expects it.
#[derive(Debug, Serialize)]
pub(crate) struct WireDatum {
    model_input: WireModelInput,
    loss_fn_inputs: WireLossInputs,
}

impl WireDatum {
    pub(crate) fn from_tensor(tensor: &TrainingTensor) -> Self {
        let n = tensor.len();
        Self {
            model_input: WireModelInput::from_tokens(tensor.input_tokens()),
            loss_fn_inputs: WireLossInputs {
                weights: WireTensorData {
                    data: tensor.loss_weights().to_vec(),
                    dtype: "float32",
                    shape: vec![n],
                },
                target_tokens: WireTensorData {
                    data: tensor.target_tokens().iter().map(|t| i64::from(*t)).collect(),
                    dtype: "int64",
                    shape: vec![n],
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireModelInput {
    chunks: Vec<WireChunk>,
}

impl WireModelInput {
    fn from_tokens(tokens: &[u32]) -> Self {
        Self { chunks: vec![WireChunk { kind: "encoded_text", tokens: tokens.to_vec() }] }
    }
}

#[derive(Debug, Serialize)]
struct WireChunk {
    #[serde(rename = "type")]
    kind: &'static str,
    tokens: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct WireLossInputs {
    weights: WireTensorData<f32>,
    target_tokens: WireTensorData<i64>,
}

#[derive(Debug, Serialize)]
struct WireTensorData<T> {
    data: Vec<T>,
    dtype: &'static str,
    shape: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct WireForwardBackward {
    loss_fn_outputs: Vec<WireLossOutput>,
}

#[derive(Debug, Deserialize)]
struct WireLossOutput {
    logprobs: WireTensorOut,
}

#[derive(Debug, Deserialize)]
struct WireTensorOut {
    data: Vec<f32>,
}

impl WireForwardBackward {
    fn into_output(self) -> ForwardBackwardOutput {
        ForwardBackwardOutput {
            loss_fn_outputs: self
                .loss_fn_outputs
                .into_iter()
                .map(|o| LossFnOutput { logprobs: o.logprobs.data })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_datum_layout() {
        let tensor = TrainingTensor::new(vec![5, 6], vec![6, 7], vec![0.0, 1.0]).unwrap();
        let json = serde_json::to_value(WireDatum::from_tensor(&tensor)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model_input": {"chunks": [{"type": "encoded_text", "tokens": [5, 6]}]},
                "loss_fn_inputs": {
                    "weights": {"data": [0.0, 1.0], "dtype": "float32", "shape": [2]},
                    "target_tokens": {"data": [6, 7], "dtype": "int64", "shape": [2]}
                }
            })
        );
    }

    #[test]
    fn test_client_creation_with_api_key() {
        let client = RemoteServiceClient::with_api_key("http://localhost:1".into(), "k".into())
            .with_poll_interval(Duration::from_millis(5));
        assert_eq!(client.api.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_from_env_missing_key_is_config_error() {
        let err =
            RemoteServiceClient::from_env("http://localhost:1".into(), "DISTILL_TEST_UNSET_KEY_VAR")
                .unwrap_err();
        assert!(matches!(err, ServiceError::ConfigError(_)));
    }
}
