//! Text-generation backends consumed by the narrator.

use std::env;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 400;

/// One message of a chat-style prompt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    /// `system` or `user`.
    pub role: &'static str,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Instructions message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    /// Request message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Failures of a single generation attempt.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// No endpoint or key was provided at startup.
    #[error("text generator is not configured")]
    Unconfigured,
    /// The HTTP client could not be built.
    #[error("failed to build text generation client")]
    ClientBuilder {
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The request could not be sent.
    #[error("text generation request failed")]
    Request {
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The service answered with a non-success status.
    #[error("text generation service answered {status}: {message}")]
    Status { status: StatusCode, message: String },
    /// The response body was not the expected JSON.
    #[error("failed to decode text generation response")]
    Decode {
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
    /// The response had no message content.
    #[error("text generation response carried no content")]
    EmptyResponse,
    /// No answer within the generation timeout.
    #[error("text generation timed out")]
    Timeout,
    /// The reply did not contain a usable narrative.
    #[error("generated reply is unusable: {0}")]
    Unparseable(String),
}

/// Opaque "generate text for prompt" dependency.
pub trait TextGenerator: Send + Sync {
    /// Send one prompt and return the raw reply text.
    fn generate(&self, messages: Vec<ChatMessage>) -> BoxFuture<'static, Result<String, GenerationError>>;
}

/// Client for OpenAI-compatible `POST {base_url}/chat/completions` endpoints.
#[derive(Clone)]
pub struct ChatCompletionsGenerator {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl ChatCompletionsGenerator {
    /// Client for `{base_url}/chat/completions` using `model`.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .build()
            .map_err(|source| GenerationError::ClientBuilder { source })?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    /// Build from `NARRATOR_BASE_URL`, `NARRATOR_API_KEY` and `NARRATOR_MODEL`.
    ///
    /// A key is required unless a custom base URL (typically a local server) is set.
    pub fn from_env() -> Result<Self, GenerationError> {
        let base_url = env::var("NARRATOR_BASE_URL").ok().filter(|v| !v.is_empty());
        let api_key = env::var("NARRATOR_API_KEY").ok().filter(|v| !v.is_empty());
        if base_url.is_none() && api_key.is_none() {
            return Err(GenerationError::Unconfigured);
        }
        let model = env::var("NARRATOR_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());
        Self::new(
            base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            api_key,
            model,
        )
    }

    /// Model sent with every request.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_request(&self, body: ChatCompletionRequest) -> Result<String, GenerationError> {
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|source| GenerationError::Request { source })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            let message = serde_json::from_str::<ErrorResponse>(&body_text)
                .map(|wrapper| wrapper.error.message)
                .unwrap_or(body_text);
            return Err(GenerationError::Status { status, message });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|source| GenerationError::Decode { source })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)
    }
}

impl TextGenerator for ChatCompletionsGenerator {
    fn generate(&self, messages: Vec<ChatMessage>) -> BoxFuture<'static, Result<String, GenerationError>> {
        let generator = self.clone();
        Box::pin(async move {
            let body = ChatCompletionRequest {
                model: generator.model.clone(),
                messages,
                max_tokens: Some(generator.max_tokens),
            };
            generator.send_request(body).await
        })
    }
}

/// Generator used when no endpoint is configured: every call fails, so the
/// narrator serves its fallback segments.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredGenerator;

impl TextGenerator for UnconfiguredGenerator {
    fn generate(&self, _messages: Vec<ChatMessage>) -> BoxFuture<'static, Result<String, GenerationError>> {
        Box::pin(async { Err(GenerationError::Unconfigured) })
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_matches_chat_completions_shape() {
        let body = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("go")],
            max_tokens: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "go");
        assert!(value.get("max_tokens").is_none());
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let generator = ChatCompletionsGenerator::new("http://localhost:8080/v1/", None, "local")
            .unwrap();
        assert_eq!(generator.endpoint, "http://localhost:8080/v1/chat/completions");
        assert_eq!(generator.model(), "local");
    }

    #[tokio::test]
    async fn unconfigured_generator_always_fails() {
        let result = UnconfiguredGenerator.generate(Vec::new()).await;
        assert!(matches!(result, Err(GenerationError::Unconfigured)));
    }
}
