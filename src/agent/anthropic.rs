//! `PhaseAgent` backed by the Anthropic Messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::agent::{AgentOutcome, PhaseAgent, PhaseRequest, prompts};
use crate::config::AgentConfig;
use crate::pipeline::state::TokenUsage;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAgent {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    messages_url: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl AnthropicAgent {
    /// Build an agent from config. Requires `ANTHROPIC_API_KEY`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("ANTHROPIC_API_KEY is not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        tracing::debug!(model = %config.model, "agent initialized");

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            messages_url: format!("{}/v1/messages", config.api_base.trim_end_matches('/')),
        })
    }

    fn request_body(&self, request: &PhaseRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": prompts::system_prompt(request.phase()),
            "messages": [
                { "role": "user", "content": request.user_message() }
            ],
        })
    }
}

/// Interpret a 2xx response body.
fn parse_success(body: &str) -> AgentOutcome {
    match serde_json::from_str::<MessagesResponse>(body) {
        Ok(resp) => {
            let content = resp
                .content
                .into_iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text)
                .collect::<Vec<_>>()
                .join("");
            AgentOutcome::completed(
                content,
                TokenUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
            )
        }
        Err(e) => AgentOutcome::failed(format!("API error: malformed response body: {}", e)),
    }
}

/// Message for a non-2xx response, preferring the provider's own text.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!("API error: {} {}", status.as_u16(), envelope.error.message),
        Err(_) if body.trim().is_empty() => format!("API error: {}", status),
        Err(_) => format!("API error: {} {}", status.as_u16(), body.trim()),
    }
}

#[async_trait]
impl PhaseAgent for AnthropicAgent {
    async fn generate(&self, request: &PhaseRequest) -> Result<AgentOutcome> {
        let agent = request.agent_name();
        let body = self.request_body(request);

        tracing::info!(agent, context_keys = request.context.len(), "agent run started");

        let response = match self
            .client
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return Err(e).context("Failed to build Messages API request");
            }
            Err(e) if e.is_timeout() => {
                tracing::error!(agent, "agent run timed out");
                return Ok(AgentOutcome::failed("Request timed out"));
            }
            Err(e) => {
                tracing::error!(agent, error = %e, "agent run failed");
                return Ok(AgentOutcome::failed(format!("API error: {}", e)));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => return Ok(AgentOutcome::failed("Request timed out")),
            Err(e) => return Ok(AgentOutcome::failed(format!("API error: {}", e))),
        };

        if !status.is_success() {
            let error = error_message(status, &text);
            tracing::error!(agent, status = status.as_u16(), %error, "agent run rejected");
            return Ok(AgentOutcome::failed(error));
        }

        let outcome = parse_success(&text);
        if let AgentOutcome::Completed { usage, .. } = &outcome {
            tracing::info!(
                agent,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "agent run succeeded"
            );
        }
        Ok(outcome)
    }
}
