//! Language model access.
//!
//! [`Generator`] is the narrow interface workflows use to turn a prompt into
//! text. [`OllamaGenerator`] calls `POST {url}/api/generate` with streaming
//! disabled and reads the `response` field of the reply.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("LLM reply has no 'response' field")]
    MissingResponse,
}

impl LlmError {
    /// Whether the model server ran out of memory or capacity: HTTP 507, an
    /// "out of memory" message, or `oom` as a word of its own.
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            LlmError::Api { status, body } => {
                let body = body.to_lowercase();
                *status == 507
                    || body.contains("out of memory")
                    || body
                        .split(|c: char| !c.is_ascii_alphanumeric())
                        .any(|word| word == "oom")
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "options": { "temperature": self.temperature },
            "stream": false,
        });
        debug!(model = %self.model, prompt_chars = prompt.len(), "Sending prompt");

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let json: serde_json::Value = response.json().await?;
        parse_generate_response(&json)
    }
}

fn parse_generate_response(json: &serde_json::Value) -> Result<String, LlmError> {
    json.get("response")
        .and_then(|r| r.as_str())
        .map(str::to_string)
        .ok_or(LlmError::MissingResponse)
}
