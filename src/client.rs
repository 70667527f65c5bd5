use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::config::ClientConfig;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, Message,
    ModelsListResponse,
};

pub const SMOKE_TEST_SYSTEM_PROMPT: &str = "你是一个助手.";
pub const SMOKE_TEST_USER_PROMPT: &str = "介绍一下北京";

/// HTTP client for the OpenAI-compatible endpoints of a running server.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ServiceClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.config.base_url().trim_end_matches('/'), path)
    }

    /// True iff `GET /v1/models` answers 200 within the health timeout.
    pub async fn check_service(&self) -> bool {
        let url = self.url("/models");
        let result = self
            .http
            .get(&url)
            .timeout(self.config.health_timeout())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == StatusCode::OK => {
                tracing::debug!(url = %url, "Service is up");
                true
            }
            Ok(resp) => {
                tracing::info!(url = %url, status = %resp.status(), "Service answered but is not healthy");
                false
            }
            Err(e) => {
                tracing::info!(url = %url, error = %e, "Service is not reachable");
                false
            }
        }
    }

    pub async fn list_models(&self) -> Result<ModelsListResponse> {
        let resp = self
            .http
            .get(self.url("/models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .context("Failed to reach models endpoint")?;

        if !resp.status().is_success() {
            anyhow::bail!("Models endpoint returned HTTP {}", resp.status());
        }

        resp.json().await.context("Failed to parse models list")
    }

    pub async fn chat_completion(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        tracing::debug!(
            model = %request.model,
            message_count = request.messages.len(),
            "Sending chat completion request"
        );

        let resp = self
            .http
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion failed: HTTP {}: {}", status, body.trim());
        }

        let response: ChatCompletionResponse = resp
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        tracing::debug!(choices = response.choices.len(), "Received chat completion");
        Ok(response)
    }

    /// Streams the delta content of each SSE chunk. The stream ends at
    /// `data: [DONE]` or when the server closes the connection.
    pub async fn chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<impl Stream<Item = Result<String>> + Unpin> {
        let request = request.clone().streaming();

        let resp = self
            .http
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send streaming chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Streaming chat completion failed: HTTP {}: {}", status, body.trim());
        }

        let (token_tx, token_rx) = mpsc::channel(100);
        // Lines are decoded only once complete, so a UTF-8 character split
        // across network chunks survives
        let body = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = token_tx.send(Err(anyhow::anyhow!("Stream read failed: {}", e))).await;
                        return;
                    }
                };
                match parse_sse_line(&line) {
                    SseLine::Content(text) => {
                        if token_tx.send(Ok(text)).await.is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                    SseLine::Done => return,
                    SseLine::Invalid(e) => {
                        let _ = token_tx.send(Err(e)).await;
                        return;
                    }
                    SseLine::Skip => {}
                }
            }
        });

        Ok(ReceiverStream::new(token_rx))
    }

    /// Sends the fixed smoke-test prompt and returns the first choice's content.
    /// Any failure is logged and reported as `None`.
    pub async fn smoke_test(&self) -> Option<String> {
        let request = ChatCompletionRequest::new(
            self.config.model.clone(),
            vec![
                Message::system(SMOKE_TEST_SYSTEM_PROMPT),
                Message::user(SMOKE_TEST_USER_PROMPT),
            ],
        )
        .with_max_tokens(self.config.smoke_test_max_tokens);

        match self.chat_completion(&request).await {
            Ok(response) => {
                let content = response.first_content().unwrap_or_default();
                tracing::info!(length = content.len(), "Smoke test passed");
                Some(content)
            }
            Err(e) => {
                tracing::error!(error = %e, "Smoke test failed");
                None
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum SseLine {
    Content(String),
    Done,
    Skip,
    Invalid(anyhow::Error),
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        // Blank separators, comments, `event:` and `id:` fields
        return SseLine::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .iter()
                .filter_map(|c| c.delta.as_ref().and_then(|d| d.content.clone()))
                .collect();
            if text.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Content(text)
            }
        }
        Err(e) => SseLine::Invalid(anyhow::anyhow!("Malformed stream chunk: {}", e)),
    }
}
