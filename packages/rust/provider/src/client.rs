//! OpenRouter-compatible chat-completions client.
//!
//! The pipeline treats all provider-specific request/response shapes as
//! normalized behind [`ModelClient::invoke`]: an ordered message list in,
//! raw response text out.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use loresmith_shared::{ChatMessage, LoresmithError, Result};

/// User-Agent string for model requests.
const USER_AGENT: &str = concat!("Loresmith/", env!("CARGO_PKG_VERSION"));

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// The model-call collaborator seam. Implementations normalize their
/// provider's wire format; the pipeline only ever sees message lists and
/// response text.
pub trait ModelClient: Send + Sync + 'static {
    /// Send the messages and resolve to the raw response text.
    fn invoke(
        &self,
        messages: Vec<ChatMessage>,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// HTTP client for OpenRouter's chat-completions endpoint.
pub struct OpenRouterClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    /// Create a client for `base_url` (e.g. `https://openrouter.ai/api/v1`).
    pub fn new(base_url: &str, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, api_key, model, DEFAULT_TIMEOUT)
    }

    /// Create a client with an explicit request timeout.
    pub fn with_timeout(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| LoresmithError::Network(format!("failed to build HTTP client: {e}")))?;

        let base = Url::parse(base_url)
            .map_err(|e| LoresmithError::config(format!("invalid provider URL {base_url}: {e}")))?;
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| LoresmithError::config(format!("invalid provider URL {base_url}: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// The model ID requests are sent with.
    pub fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn send(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LoresmithError::Timeout(format!("model call timed out: {e}"))
                } else {
                    LoresmithError::Network(format!("model call failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LoresmithError::Network(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(LoresmithError::provider(format!(
                "HTTP {status}: {}",
                provider_error_message(&text)
            )));
        }

        let payload: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LoresmithError::provider(format!("invalid response payload: {e}")))?;

        let content = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                LoresmithError::provider("response carries no choices[0].message.content")
            })?;

        debug!(chars = content.len(), "model responded");
        Ok(content.to_string())
    }
}

impl ModelClient for OpenRouterClient {
    async fn invoke(&self, messages: Vec<ChatMessage>) -> Result<String> {
        self.send(messages).await
    }
}

/// Pull the human-readable message out of a provider error body, falling
/// back to the raw (truncated) body.
fn provider_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
    }
    body.chars().take(300).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are an extraction engine."),
            ChatMessage::user("Chapter text here."),
        ]
    }

    #[tokio::test]
    async fn successful_call_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "messages": [{"role": "system"}, {"role": "user"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"a\":1}"}}]
            })))
            .mount(&server)
            .await;

        let client =
            OpenRouterClient::new(&format!("{}/", server.uri()), "key", "test-model").unwrap();
        let text = client.invoke(messages()).await.expect("invoke");
        assert_eq!(text, "{\"a\":1}");
    }

    #[tokio::test]
    async fn provider_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "rate limited, slow down"}
            })))
            .mount(&server)
            .await;

        let client =
            OpenRouterClient::new(&format!("{}/", server.uri()), "key", "test-model").unwrap();
        let err = client.invoke(messages()).await.expect_err("must fail");
        assert!(matches!(err, LoresmithError::Provider { .. }));
        assert!(err.to_string().contains("rate limited"));
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn token_limit_phrasing_survives_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "This model's maximum context length is 8192 tokens"}
            })))
            .mount(&server)
            .await;

        let client =
            OpenRouterClient::new(&format!("{}/", server.uri()), "key", "test-model").unwrap();
        let err = client.invoke(messages()).await.expect_err("must fail");
        // The provider message is preserved so callers can classify it.
        assert!(err.to_string().contains("maximum context length"));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client =
            OpenRouterClient::new(&format!("{}/", server.uri()), "key", "test-model").unwrap();
        let err = client.invoke(messages()).await.expect_err("must fail");
        assert!(err.to_string().contains("no choices"));
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({
                        "choices": [{"message": {"content": "late"}}]
                    })),
            )
            .mount(&server)
            .await;

        let client = OpenRouterClient::with_timeout(
            &format!("{}/", server.uri()),
            "key",
            "test-model",
            Duration::from_millis(50),
        )
        .unwrap();
        let err = client.invoke(messages()).await.expect_err("must fail");
        assert!(matches!(err, LoresmithError::Timeout(_)));
    }
}
