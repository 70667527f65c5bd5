//! Health check and chat client against small axum stand-ins for FastDeploy.

mod common;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{client_config, dead_base_url, spawn_server};
use ernie_deploy::client::{SMOKE_TEST_SYSTEM_PROMPT, SMOKE_TEST_USER_PROMPT};
use ernie_deploy::openai::{ChatCompletionRequest, Message};
use ernie_deploy::ServiceClient;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

async fn models_ok() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{"id": "baidu/ERNIE-4.5-21B-A3B-Paddle", "object": "model", "created": 0, "owned_by": "fastdeploy"}]
    }))
}

fn completion(content: &str) -> Json<Value> {
    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "created": 0,
        "model": "ernie",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    }))
}

#[tokio::test]
async fn healthy_when_models_answers_200() {
    let base = spawn_server(Router::new().route("/v1/models", get(models_ok))).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();
    assert!(client.check_service().await);

    let models = client.list_models().await.unwrap();
    assert_eq!(models.data.len(), 1);
    assert_eq!(models.data[0].id, "baidu/ERNIE-4.5-21B-A3B-Paddle");
}

#[tokio::test]
async fn unhealthy_on_error_status() {
    let router = Router::new().route("/v1/models", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let base = spawn_server(router).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();
    assert!(!client.check_service().await);
    assert!(client.list_models().await.is_err());
}

#[tokio::test]
async fn unhealthy_when_nothing_listens() {
    let client = ServiceClient::new(client_config(&dead_base_url().await)).unwrap();
    assert!(!client.check_service().await);
}

// Slower than the 1 s health timeout used by `client_config`
async fn slow_models() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    models_ok().await
}

#[tokio::test]
async fn unhealthy_when_slower_than_health_timeout() {
    let base = spawn_server(Router::new().route("/v1/models", get(slow_models))).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();

    let started = std::time::Instant::now();
    assert!(!client.check_service().await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn smoke_test_sends_fixed_prompt() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["stream"], false);
            assert_eq!(body["messages"][0]["role"], "system");
            assert_eq!(body["messages"][0]["content"], SMOKE_TEST_SYSTEM_PROMPT);
            assert_eq!(body["messages"][1]["role"], "user");
            let reply = format!(
                "{}|{}",
                body["messages"][1]["content"].as_str().unwrap_or_default(),
                body["max_tokens"]
            );
            completion(&reply)
        }),
    );
    let base = spawn_server(router).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();

    let content = client.smoke_test().await.expect("smoke test should pass");
    assert_eq!(content, format!("{}|128", SMOKE_TEST_USER_PROMPT));
}

#[tokio::test]
async fn smoke_test_fails_on_server_error() {
    let router = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "engine crashed") }),
    );
    let base = spawn_server(router).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();
    assert!(client.smoke_test().await.is_none());

    let err = client
        .chat_completion(&ChatCompletionRequest::new("null", vec![Message::user("hi")]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("engine crashed"));
}

#[tokio::test]
async fn smoke_test_fails_when_unreachable() {
    let client = ServiceClient::new(client_config(&dead_base_url().await)).unwrap();
    assert!(client.smoke_test().await.is_none());
}

#[tokio::test]
async fn streaming_yields_delta_content() {
    let body = concat!(
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"北京是\"}}]}\n\n",
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"中国的首都\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(req): Json<Value>| async move {
            assert_eq!(req["stream"], true);
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        }),
    );
    let base = spawn_server(router).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();

    let request = ChatCompletionRequest::new("null", vec![Message::user(SMOKE_TEST_USER_PROMPT)]);
    let tokens: Vec<String> = client
        .chat_completion_stream(&request)
        .await
        .unwrap()
        .map(|t| t.unwrap())
        .collect()
        .await;
    assert_eq!(tokens, vec!["北京是".to_string(), "中国的首都".to_string()]);
}

#[tokio::test]
async fn streaming_keeps_characters_split_across_chunks() {
    let event = concat!(
        "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"北京\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    // Cut after the first byte of the three-byte '北'
    let cut = event.find('北').unwrap() + 1;
    let chunks = vec![event.as_bytes()[..cut].to_vec(), event.as_bytes()[cut..].to_vec()];

    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let chunks = chunks.clone();
            async move {
                let body = futures::stream::iter(chunks).then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::io::Error>(chunk)
                });
                ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(body))
            }
        }),
    );
    let base = spawn_server(router).await;
    let client = ServiceClient::new(client_config(&base)).unwrap();

    let request = ChatCompletionRequest::new("null", vec![Message::user(SMOKE_TEST_USER_PROMPT)]);
    let tokens: Vec<String> = client
        .chat_completion_stream(&request)
        .await
        .unwrap()
        .map(|t| t.unwrap())
        .collect()
        .await;
    assert_eq!(tokens, vec!["北京".to_string()]);
}
