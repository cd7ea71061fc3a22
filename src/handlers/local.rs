//! Local inference through an Ollama-compatible endpoint.

use super::chat::build_transcript;
use super::{Handler, HandlerBuildError, HandlerError, HandlerMessage};
use crate::domain_types::AgentName;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Chat calls go to a local process; generation dominates, so the timeout
/// is generous.
const CHAT_TIMEOUT: Duration = Duration::from_secs(600);

/// Calls a local `/api/chat` endpoint.
pub struct OllamaHandler {
    http: reqwest::Client,
    base_url: String,
    model: String,
    agent: AgentName,
    system_prompt: Option<String>,
}

impl OllamaHandler {
    /// Creates the handler against `base_url`.
    #[must_use]
    pub fn new(
        base_url: String,
        model: String,
        agent: AgentName,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            model,
            agent,
            system_prompt,
        }
    }
}

#[async_trait]
impl Handler for OllamaHandler {
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

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| HandlerError::new(format!("local endpoint unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| HandlerError::new(format!("local endpoint error: {e}")))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| HandlerError::new(format!("malformed local response: {e}")))?;
        let reply = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("local response missing message content"))?;

        debug!(model = %self.model, chars = reply.len(), "local model replied");
        let trimmed = reply.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }
}

/// Enumerates the models the local endpoint currently serves.
///
/// # Errors
///
/// Returns a [`HandlerBuildError`] if the endpoint is unreachable or
/// answers with an unexpected shape.
pub async fn list_models(base_url: &str) -> Result<Vec<String>, HandlerBuildError> {
    let body: Value = reqwest::Client::new()
        .get(format!("{base_url}/api/tags"))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| HandlerBuildError::LocalEndpoint {
            reason: e.to_string(),
        })?
        .json()
        .await
        .map_err(|e| HandlerBuildError::LocalEndpoint {
            reason: e.to_string(),
        })?;

    let models = body
        .get("models")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(models)
}
