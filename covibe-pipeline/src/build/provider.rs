//! Build provider: turns a request into a source artifact.
//!
//! The production provider speaks the OpenAI-compatible chat-completions
//! protocol (Moonshot/Kimi by default). [`RetryPolicy`] wraps any provider
//! with bounded, linearly backed-off retries on transient failures.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::LlmConfig;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("LLM_TIMEOUT")]
    Timeout,
    #[error("LLM_HTTP_{status}:{body}")]
    Http { status: u16, body: String },
    #[error("LLM_EMPTY_CODE")]
    EmptyOutput,
    #[error("LLM_BAD_JSON_RESPONSE")]
    BadResponse,
    #[error("LLM_TRANSPORT:{0}")]
    Transport(String),
    #[error("MISSING_LLM_API_KEY")]
    NotConfigured,
}

impl ProviderError {
    /// Timeouts, server errors and empty output are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::EmptyOutput => true,
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Synthesizes a self-contained UI module bound to `module_id`.
///
/// A failed call must leave no side effects so it can be retried.
#[async_trait]
pub trait BuildProvider: Send + Sync {
    async fn generate(&self, request: &str, module_id: &str) -> Result<String, ProviderError>;
}

/// Bounded retry with linear backoff (`backoff * attempt`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(1000),
        }
    }
}

/// Provider output after retries.
#[derive(Debug, Clone)]
pub struct Generated {
    pub code: String,
    pub attempts: u32,
}

/// Last error once retries are exhausted or a non-retryable error hit.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub error: ProviderError,
    pub attempts: u32,
}

impl RetryPolicy {
    pub async fn generate(
        &self,
        provider: &dyn BuildProvider,
        request: &str,
        module_id: &str,
    ) -> Result<Generated, Exhausted> {
        let max_attempts = self.max_retries + 1;
        let mut attempt = 1;
        loop {
            let result = match provider.generate(request, module_id).await {
                Ok(code) if code.trim().is_empty() => Err(ProviderError::EmptyOutput),
                other => other,
            };
            match result {
                Ok(code) => {
                    return Ok(Generated {
                        code,
                        attempts: attempt,
                    });
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.backoff * attempt;
                    tracing::warn!(
                        module_id,
                        attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Build provider failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

/// OpenAI-compatible chat-completions client.
pub struct ChatCompletionsProvider {
    api_key: Option<String>,
    base_url: String,
    model: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ChatCompletionsProvider {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: config.timeout,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl BuildProvider for ChatCompletionsProvider {
    async fn generate(&self, request: &str, module_id: &str) -> Result<String, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;

        let body = json!({
            "model": &self.model,
            "temperature": 1,
            "max_tokens": 2500,
            "messages": [
                { "role": "system", "content": system_prompt(module_id) },
                { "role": "user", "content": user_prompt(request) },
            ],
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let value: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::BadResponse
            }
        })?;
        let code = strip_code_fences(&extract_content(&value));
        if code.is_empty() {
            return Err(ProviderError::EmptyOutput);
        }
        Ok(code)
    }
}

fn map_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(e.to_string())
    }
}

fn system_prompt(module_id: &str) -> String {
    format!(
        "You are the build agent of a self-extending website. \
         Generate ONLY executable JavaScript code (no markdown). \
         Return one self-contained IIFE module. \
         The module identifier must be exactly \"{module_id}\". \
         The code must call window.registerFeature('{module_id}', createCard). \
         createCard must return a DOM element with class \"card\". \
         Use vanilla JavaScript only. \
         Do not use eval, new Function or document.write. \
         Escape user-provided text with window.escapeHTML when rendering dynamic content. \
         Add one <small> timestamp element inside the card."
    )
}

fn user_prompt(request: &str) -> String {
    format!(
        "User request: {request}\nGenerate the complete, runnable front-end component.\nNo explanations, no markdown."
    )
}

/// Pull the assistant text out of a chat-completions response. Content may
/// be a plain string or an array of text blocks.
pub fn extract_content(response: &Value) -> String {
    let content = &response["choices"][0]["message"]["content"];
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) => part["text"]
                    .as_str()
                    .or_else(|| part["content"].as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => content["text"]
            .as_str()
            .or_else(|| content["content"].as_str())
            .unwrap_or_default()
            .to_string(),
        _ => response["output_text"].as_str().unwrap_or_default().to_string(),
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim().to_string()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
