//! The graph handler: an agent-framework variant where the operator picks
//! the model provider underneath.
//!
//! Unlike the fixed-provider handlers, graph agents advertise the MCP tool
//! subservers from the agent's configuration in their system prompt, so
//! the framework can route tool calls through them. The kernel only wires
//! the pieces together; what the framework does with the tools is its own
//! business.

use super::{Handler, HandlerBuildError, HandlerError, HandlerMessage};
use super::{AnthropicHandler, OllamaHandler, OpenAiHandler};
use crate::config::AgentConfig;
use crate::domain_types::AgentName;
use async_trait::async_trait;

enum Backend {
    Ollama(OllamaHandler),
    OpenAi(OpenAiHandler),
    Anthropic(AnthropicHandler),
}

/// Provider-parameterised framework handler.
pub struct GraphHandler {
    backend: Backend,
}

impl GraphHandler {
    /// Assembles the handler for `provider`, folding the agent's tool
    /// subserver list into the system prompt.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerBuildError`] for unknown providers or missing
    /// credentials.
    pub fn build(
        provider: &str,
        ollama_url: String,
        model: String,
        agent: AgentName,
        system_prompt: Option<String>,
        agent_config: &AgentConfig,
    ) -> Result<Self, HandlerBuildError> {
        let system_prompt = Some(augment_prompt(system_prompt, agent_config));
        let backend = match provider {
            "ollama" => Backend::Ollama(OllamaHandler::new(ollama_url, model, agent, system_prompt)),
            "openai" => {
                let key = require_env("OPENAI_API_KEY")?;
                Backend::OpenAi(OpenAiHandler::new(key, model, agent, system_prompt))
            }
            "anthropic" => {
                let key = require_env("ANTHROPIC_API_KEY")?;
                Backend::Anthropic(AnthropicHandler::new(key, model, agent, system_prompt))
            }
            other => {
                return Err(HandlerBuildError::UnknownProvider {
                    provider: other.to_string(),
                });
            }
        };
        Ok(Self { backend })
    }
}

fn require_env(variable: &'static str) -> Result<String, HandlerBuildError> {
    std::env::var(variable)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(HandlerBuildError::MissingCredential {
            kind: crate::registry::HandlerKind::Graph,
            variable,
        })
}

fn augment_prompt(system_prompt: Option<String>, agent_config: &AgentConfig) -> String {
    let mut prompt = system_prompt.unwrap_or_default();
    if !agent_config.mcp_servers.is_empty() {
        let mut names: Vec<&str> = agent_config.mcp_servers.keys().map(String::as_str).collect();
        names.sort_unstable();
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str("Tool servers available to you: ");
        prompt.push_str(&names.join(", "));
        prompt.push('.');
    }
    prompt
}

#[async_trait]
impl Handler for GraphHandler {
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        batch: &[HandlerMessage],
        history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        match &self.backend {
            Backend::Ollama(h) => h.handle(trigger, batch, history).await,
            Backend::OpenAi(h) => h.handle(trigger, batch, history).await,
            Backend::Anthropic(h) => h.handle(trigger, batch, history).await,
        }
    }
}
