//! Text completion service.
//!
//! One request in, one answer out. Retries are not owned here: a failed
//! completion surfaces as [`PipelineError::Completion`](crate::error::PipelineError).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::config::CompletionConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI chat completions (`POST /v1/chat/completions`), single user turn.
pub struct OpenAICompletion {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            client,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAICompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

/// Always fails; selected by `completion.provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionService for DisabledCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        bail!("Completion provider is disabled")
    }
}

pub fn create_completion(config: &CompletionConfig) -> Result<Arc<dyn CompletionService>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response_trims() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Refunds take 14 days.\n" } }]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "Refunds take 14 days.");
    }

    #[test]
    fn test_parse_chat_response_missing_content() {
        assert!(parse_chat_response(&serde_json::json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_completion_fails() {
        let config = CompletionConfig {
            provider: "disabled".into(),
            ..Default::default()
        };
        let service = create_completion(&config).unwrap();
        let request = CompletionRequest {
            prompt: "p".into(),
            model: "m".into(),
            max_tokens: 1,
            temperature: 0.0,
        };
        assert!(service.complete(&request).await.is_err());
    }
}
