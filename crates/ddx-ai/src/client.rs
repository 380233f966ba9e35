//! Model call interface and the OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model returned no message content")]
    EmptyResponse,
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
}

/// One request/response exchange with a language model.
///
/// `strict_json` asks the backend to constrain output to a JSON object.
/// Implementations return the raw response text; parsing is the caller's job.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(
        &self,
        system: &str,
        user: &str,
        strict_json: bool,
    ) -> Result<String, ModelError>;
}

/// Invoke `client`, giving up after `timeout`.
pub async fn invoke_with_timeout(
    client: &dyn ModelClient,
    system: &str,
    user: &str,
    strict_json: bool,
    timeout: Duration,
) -> Result<String, ModelError> {
    tokio::time::timeout(timeout, client.invoke(system, user, strict_json))
        .await
        .map_err(|_| ModelError::Timeout(timeout))?
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire format.
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    /// `base_url` is like `https://api.openai.com/v1`; a trailing slash is
    /// tolerated. `timeout` bounds each HTTP request end to end.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request<'a>(&'a self, system: &'a str, user: &'a str, strict_json: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: strict_json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn invoke(
        &self,
        system: &str,
        user: &str,
        strict_json: bool,
    ) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(system, user, strict_json);

        debug!(url = %url, model = %self.model, prompt_chars = user.len(), "invoking model");
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&resp.text().await?)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)
    }
}
