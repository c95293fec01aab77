//! OpenAI-compatible chat completion resolver.
//!
//! Works with any `/chat/completions` endpoint (LiteLLM, OpenRouter,
//! OpenAI, local gateways).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{normalize_commands, InstructionResolver};
use crate::error::ResolveError;

/// README characters sent to the model.
pub const MAX_README_CHARS: usize = 2000;

const PROMPT: &str = "Extract setup, install, build, and run commands from this README. \
Return only the shell commands, one per line, without explanations.";

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Asks a chat model for the setup commands in a README.
pub struct LlmInstructionResolver {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http_client: Client,
}

impl LlmInstructionResolver {
    /// Creates a resolver for the given endpoint.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL of the API (e.g., "http://localhost:4000")
    /// * `api_key` - Optional bearer token
    /// * `model` - Model identifier sent with every request
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, ResolveError> {
        Self::with_timeout(api_base, api_key, model, Duration::from_secs(30))
    }

    pub fn with_timeout(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ResolveError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http_client,
        })
    }

    fn build_request(&self, readme: &str) -> ChatRequest<'_> {
        let excerpt: String = readme.chars().take(MAX_README_CHARS).collect();
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: format!("{}\n\n{}", PROMPT, excerpt),
            }],
            temperature: 0.0,
        }
    }
}

#[async_trait]
impl InstructionResolver for LlmInstructionResolver {
    async fn resolve(&self, readme: &str) -> Result<Option<String>, ResolveError> {
        let url = format!("{}/chat/completions", self.api_base);

        let mut http_request = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let http_response = http_request
            .json(&self.build_request(readme))
            .send()
            .await
            .map_err(|e| ResolveError::RequestFailed(e.to_string()))?;

        let status = http_response.status();

        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());

            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            return Err(ResolveError::ApiError {
                code: status.as_u16(),
                message,
            });
        }

        let response: ChatResponse = http_response
            .json()
            .await
            .map_err(|e| ResolveError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let commands = normalize_commands(&content);
        debug!(model = %self.model, found = commands.is_some(), "Resolved setup instructions");
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "model": "test-model",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })
    }

    #[test]
    fn test_request_truncates_readme() {
        let resolver =
            LlmInstructionResolver::new("http://localhost:4000/", None, "m").expect("client");
        let readme = "x".repeat(5000);
        let request = resolver.build_request(&readme);

        let content = &request.messages[0].content;
        assert!(content.starts_with("Extract setup"));
        assert_eq!(content.matches('x').count(), MAX_README_CHARS);
        assert_eq!(resolver.api_base, "http://localhost:4000");
    }

    #[tokio::test]
    async fn test_resolve_normalizes_model_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("```sh\nnpm ci\nnpm test\n```")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver =
            LlmInstructionResolver::new(server.uri(), Some("secret".to_string()), "test-model")
                .expect("client");
        let commands = resolver.resolve("# Project\nRun npm ci").await.expect("resolve");

        assert_eq!(commands.as_deref(), Some("npm ci && npm test"));
    }

    #[tokio::test]
    async fn test_resolve_empty_answer_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("")))
            .mount(&server)
            .await;

        let resolver = LlmInstructionResolver::new(server.uri(), None, "m").expect("client");
        assert_eq!(resolver.resolve("readme").await.expect("resolve"), None);
    }

    #[tokio::test]
    async fn test_resolve_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"message": "rate limited"}
            })))
            .mount(&server)
            .await;

        let resolver = LlmInstructionResolver::new(server.uri(), None, "m").expect("client");
        let err = resolver.resolve("readme").await.expect_err("must fail");

        assert!(matches!(err, ResolveError::ApiError { code: 429, .. }));
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_resolve_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let resolver = LlmInstructionResolver::new(server.uri(), None, "m").expect("client");
        let err = resolver.resolve("readme").await.expect_err("must fail");
        assert!(matches!(err, ResolveError::ParseError(_)));
    }
}
