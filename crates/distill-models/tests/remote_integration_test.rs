//! Integration tests for the remote training service client against a mock HTTP server.

use std::time::Duration;

use distill_abstraction::{
    AdamParams, LossKind, SamplingParams, ServiceError, ServiceProvider, TrainingService,
    TrainingTensor,
};
use distill_models::RemoteServiceClient;
use mockito::Matcher;

fn client(url: String) -> RemoteServiceClient {
    RemoteServiceClient::with_api_key(url, "test-key".to_string())
        .with_poll_interval(Duration::from_millis(5))
        .with_request_timeout(Duration::from_secs(5))
}

async fn session_mock(server: &mut mockito::ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/create_session")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(serde_json::json!({"base_model": "base", "lora_rank": 8})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id": "sess-1"}"#)
        .create_async()
        .await
}

#[tokio::test]
async fn test_forward_backward_is_pipelined() {
    let mut server = mockito::Server::new_async().await;
    let create = session_mock(&mut server).await;

    let submit = server
        .mock("POST", "/forward_backward")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "session_id": "sess-1",
            "loss_fn": "cross_entropy"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "fb-1"}"#)
        .create_async()
        .await;

    let retrieve = server
        .mock("POST", "/retrieve_future")
        .match_body(Matcher::PartialJson(serde_json::json!({"request_id": "fb-1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"status": "complete",
                "result": {"loss_fn_outputs": [{"logprobs": {"data": [-0.5, -1.5]}}]}}"#,
        )
        .create_async()
        .await;

    let session = client(server.url()).create_training_session("base", 8).await.unwrap();
    let tensor = TrainingTensor::new(vec![1, 2], vec![2, 3], vec![0.0, 1.0]).unwrap();

    let pending = session.submit_forward_backward(&[tensor], LossKind::CrossEntropy).await.unwrap();
    assert_eq!(pending.request_id(), "fb-1");

    let output = pending.await.unwrap();
    assert_eq!(output.loss_fn_outputs.len(), 1);
    assert_eq!(output.loss_fn_outputs[0].logprobs, vec![-0.5, -1.5]);

    create.assert_async().await;
    submit.assert_async().await;
    retrieve.assert_async().await;
}

#[tokio::test]
async fn test_failed_future_is_request_failed() {
    let mut server = mockito::Server::new_async().await;
    let _create = session_mock(&mut server).await;

    let _submit = server
        .mock("POST", "/optim_step")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "opt-1"}"#)
        .create_async()
        .await;

    let _retrieve = server
        .mock("POST", "/retrieve_future")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "failed", "error": "gradient overflow"}"#)
        .create_async()
        .await;

    let session = client(server.url()).create_training_session("base", 8).await.unwrap();
    let pending = session.submit_optimizer_step(&AdamParams::default()).await.unwrap();

    match pending.await {
        Err(ServiceError::RequestFailed { request_id, message }) => {
            assert_eq!(request_id, "opt-1");
            assert_eq!(message, "gradient overflow");
        }
        other => panic!("expected RequestFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_checkpoint_is_not_found() {
    let mut server = mockito::Server::new_async().await;
    let _create = session_mock(&mut server).await;

    let _load = server
        .mock("POST", "/load_state")
        .with_status(404)
        .with_body("no such checkpoint")
        .create_async()
        .await;

    let session = client(server.url()).create_training_session("base", 8).await.unwrap();
    let err = session.load_checkpoint("missing").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_server_error_keeps_status() {
    let mut server = mockito::Server::new_async().await;
    let _create = server
        .mock("POST", "/create_session")
        .with_status(503)
        .with_body("overloaded")
        .create_async()
        .await;

    let err = client(server.url()).create_training_session("base", 8).await.err().unwrap();
    assert_eq!(err, ServiceError::ResponseError { status: 503, body: "overloaded".to_string() });
}

#[tokio::test]
async fn test_sample_from_saved_weights() {
    let mut server = mockito::Server::new_async().await;
    let _create = session_mock(&mut server).await;

    let _save = server
        .mock("POST", "/save_weights_for_sampler")
        .match_body(Matcher::PartialJson(serde_json::json!({"name": "exp_final"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"path": "svc://weights/exp_final"}"#)
        .create_async()
        .await;

    let sample = server
        .mock("POST", "/sample")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "model_path": "svc://weights/exp_final",
            "num_samples": 1
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "s-1"}"#)
        .create_async()
        .await;

    let _retrieve = server
        .mock("POST", "/retrieve_future")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "complete", "result": {"sequences": [{"tokens": [7, 8, 9]}]}}"#)
        .create_async()
        .await;

    let session = client(server.url()).create_training_session("base", 8).await.unwrap();
    let sampler = session.get_inference_handle("exp_final").await.unwrap();
    assert_eq!(sampler.model_id(), "exp_final");

    let tokens = sampler.sample(&[1, 2], &SamplingParams::default()).await.unwrap();
    assert_eq!(tokens, vec![7, 8, 9]);
    sample.assert_async().await;
}
