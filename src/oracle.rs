//! Text-completion oracle abstraction and implementations.
//!
//! Defines the [`Oracle`] trait and concrete implementations:
//! - **[`DisabledOracle`]**: returns errors; used when no provider is configured.
//! - **[`OpenAiOracle`]**: calls the OpenAI chat-completions API with retry and backoff.
//! - **[`OllamaOracle`]**: calls a local Ollama instance's `/api/generate` endpoint.
//! - **[`ScriptedOracle`]**: replays canned completions in order; for offline runs and tests.
//!
//! # Retry Strategy
//!
//! The HTTP oracles use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors (including the client timeout) → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::error::PipelineError;

/// Per-call generation options.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop_sequences: Vec<String>,
}

impl CompletionOptions {
    /// Temperature 0: every pipeline stage wants reproducible output.
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: 0.0,
            stop_sequences: Vec::new(),
        }
    }
}

/// A black-box service mapping a prompt to a completion.
///
/// Implementations may be slow, fallible, and non-deterministic at
/// temperature > 0. Retry and timeout policy belongs to the implementation.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Model identifier (e.g. `"gpt-3.5-turbo"`).
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}

// ============ Disabled Oracle ============

/// Used when `oracle.provider = "disabled"`. Every call fails.
pub struct DisabledOracle;

#[async_trait]
impl Oracle for DisabledOracle {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
        bail!("Oracle provider is disabled. Set [oracle] provider in config.")
    }
}

// ============ OpenAI Oracle ============

/// Oracle backed by the OpenAI chat-completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiOracle {
    model: String,
    api_key: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiOracle {
    /// # Errors
    ///
    /// Returns an error if `model` is not set or `OPENAI_API_KEY` is missing.
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            api_key,
            url,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "n": 1,
        });
        if !options.stop_sequences.is_empty() {
            body["stop"] = serde_json::json!(options.stop_sequences);
        }

        let json = post_with_retry(self.max_retries, "OpenAI", || {
            self.client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        parse_openai_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_openai_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content")
        })
}

// ============ Ollama Oracle ============

/// Oracle backed by a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaOracle {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("oracle.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            url,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl Oracle for OllamaOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
                "stop": options.stop_sequences,
            },
        });

        let endpoint = format!("{}/api/generate", self.url);
        let json = post_with_retry(self.max_retries, "Ollama", || {
            self.client
                .post(&endpoint)
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;

        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing response field"))
    }
}

/// Send a JSON request, retrying transient failures with exponential backoff.
async fn post_with_retry<F>(max_retries: u32, label: &str, build: F) -> Result<serde_json::Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, "{} retry backoff", label);
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error, retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    warn!(%status, attempt, "{} API transient error", label);
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        label,
                        status,
                        body_text
                    ));
                    continue;
                }

                // Client error (not 429), no retry
                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                warn!(error = %e, attempt, "{} connection error", label);
                last_err = Some(anyhow::anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} completion failed after retries", label)))
}

// ============ Scripted Oracle ============

/// Replays canned completions in order and records every prompt it sees.
///
/// Running out of completions is an error, which makes unexpected extra
/// oracle calls visible in tests.
pub struct ScriptedOracle {
    completions: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(completions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            completions: Mutex::new(completions.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.completions.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut completions = self
            .completions
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted oracle lock poisoned"))?;
        completions
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted oracle has no completions left"))
    }
}

/// One deterministic completion for a pipeline stage. Failures after the
/// oracle's own retries surface as [`PipelineError::Oracle`].
pub async fn ask(
    oracle: &dyn Oracle,
    stage: &str,
    prompt: &str,
    max_tokens: u32,
) -> std::result::Result<String, PipelineError> {
    debug!(stage, model = oracle.model_name(), prompt_len = prompt.len(), "oracle call");
    let completion = oracle
        .complete(prompt, &CompletionOptions::deterministic(max_tokens))
        .await
        .map_err(PipelineError::Oracle)?;
    debug!(stage, completion_len = completion.len(), "oracle answered");
    Ok(completion)
}

/// Create the appropriate [`Oracle`] based on configuration.
///
/// | Config Value | Oracle |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledOracle`] |
/// | `"openai"` | [`OpenAiOracle`] |
/// | `"ollama"` | [`OllamaOracle`] |
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn Oracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledOracle)),
        "openai" => Ok(Box::new(OpenAiOracle::new(config)?)),
        "ollama" => Ok(Box::new(OllamaOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}
