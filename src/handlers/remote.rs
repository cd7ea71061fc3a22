//! Remote model handlers: `OpenAI` chat completions and Anthropic messages.

use super::chat::{build_transcript, merge_consecutive_roles};
use super::{Handler, HandlerError, HandlerMessage};
use crate::domain_types::AgentName;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(300);
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_REPLY_TOKENS: u32 = 2048;

fn non_empty(reply: &str) -> Option<String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Calls the `OpenAI` chat completions API.
pub struct OpenAiHandler {
    http: reqwest::Client,
    api_key: String,
    model: String,
    agent: AgentName,
    system_prompt: Option<String>,
    base_url: String,
}

impl OpenAiHandler {
    /// Creates the handler. The key comes from the process environment.
    #[must_use]
    pub fn new(
        api_key: String,
        model: String,
        agent: AgentName,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            agent,
            system_prompt,
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    /// Points the handler at a different endpoint, for tests and proxies.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Handler for OpenAiHandler {
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        batch: &[HandlerMessage],
        history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for turn in build_transcript(&self.agent, trigger, batch, history) {
            messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
        }

        let body: Value = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(REMOTE_TIMEOUT)
            .json(&json!({ "model": self.model, "messages": messages }))
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("openai unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| HandlerError::new(format!("openai error: {e}")))?
            .json()
            .await
            .map_err(|e| HandlerError::new(format!("malformed openai response: {e}")))?;

        let reply = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("openai response missing content"))?;
        Ok(non_empty(reply))
    }
}

/// Calls the Anthropic messages API.
pub struct AnthropicHandler {
    http: reqwest::Client,
    api_key: String,
    model: String,
    agent: AgentName,
    system_prompt: Option<String>,
    base_url: String,
}

impl AnthropicHandler {
    /// Creates the handler. The key comes from the process environment.
    #[must_use]
    pub fn new(
        api_key: String,
        model: String,
        agent: AgentName,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            agent,
            system_prompt,
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    /// Points the handler at a different endpoint, for tests and proxies.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Handler for AnthropicHandler {
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        batch: &[HandlerMessage],
        history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        // The messages API takes the system prompt out of band and rejects
        // consecutive same-role turns.
        let turns = merge_consecutive_roles(build_transcript(&self.agent, trigger, batch, history));
        let messages: Vec<Value> = turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content }))
            .collect();

        let mut request = json!({
            "model": self.model,
            "max_tokens": MAX_REPLY_TOKENS,
            "messages": messages,
        });
        if let Some(system) = &self.system_prompt {
            request["system"] = json!(system);
        }

        let body: Value = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(REMOTE_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("anthropic unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| HandlerError::new(format!("anthropic error: {e}")))?
            .json()
            .await
            .map_err(|e| HandlerError::new(format!("malformed anthropic response: {e}")))?;

        let reply = body
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("anthropic response missing text"))?;
        Ok(non_empty(reply))
    }
}
