//! AI completion oracle used for classification fallback.
//!
//! The oracle is opaque: a system instruction and a user message go in, a
//! JSON object (as text) comes out. Callers parse and validate the reply
//! themselves and degrade to local results when anything goes wrong.
//!
//! # Providers
//!
//! | Config Value | Oracle |
//! |-------------|--------|
//! | `"disabled"` | [`DisabledOracle`] (always errors, no I/O) |
//! | `"openai"` | [`OpenAIOracle`] (chat completions, JSON mode) |
//!
//! # Retry Strategy
//!
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - Other 4xx → fail immediately
//! - Network errors → retry

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OracleConfig;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

#[async_trait]
pub trait CompletionOracle: Send + Sync {
    /// Returns the raw JSON text of the completion.
    async fn complete_json(&self, system: &str, user: &str) -> Result<String>;

    fn name(&self) -> &str;
}

/// Used when `oracle.provider = "disabled"`.
pub struct DisabledOracle;

#[async_trait]
impl CompletionOracle for DisabledOracle {
    async fn complete_json(&self, _system: &str, _user: &str) -> Result<String> {
        bail!("completion oracle is disabled")
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// OpenAI chat completions with `response_format = json_object`.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIOracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAIOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl CompletionOracle for OpenAIOracle {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0,
            "max_tokens": 200,
            "response_format": { "type": "json_object" },
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying oracle request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(OPENAI_CHAT_URL)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("oracle request failed after retries")))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Pulls `choices[0].message.content` out of a chat completion.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

pub fn create_oracle(config: &OracleConfig) -> Result<Arc<dyn CompletionOracle>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledOracle)),
        "openai" => Ok(Arc::new(OpenAIOracle::new(config)?)),
        other => bail!("Unknown oracle provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_content() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "{\"drawing_type\":\"elevation\"}" } }]
        });
        assert_eq!(
            parse_chat_response(&json).unwrap(),
            "{\"drawing_type\":\"elevation\"}"
        );
    }

    #[test]
    fn missing_choices_is_an_error() {
        let json = serde_json::json!({ "error": { "message": "bad" } });
        assert!(parse_chat_response(&json).is_err());
    }

    #[tokio::test]
    async fn disabled_oracle_always_errors() {
        let oracle = create_oracle(&OracleConfig::default()).unwrap();
        assert_eq!(oracle.name(), "disabled");
        assert!(oracle.complete_json("sys", "user").await.is_err());
    }
}
