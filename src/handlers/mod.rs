//! Pluggable message handlers.
//!
//! A handler turns a claimed trigger message, its batch of concurrent
//! messages, and a slice of conversation history into a reply, or
//! abstains. The kernel treats handlers opaquely: inputs are plain data,
//! the call may take arbitrarily long, and the only contract is the return
//! value. The closed set of variants lives in the framework registry.

mod chat;
mod echo;
mod graph;
mod local;
mod remote;

pub use chat::{ChatRole, ChatTurn, build_transcript};
pub use echo::EchoHandler;
pub use graph::GraphHandler;
pub use local::OllamaHandler;
pub use remote::{AnthropicHandler, OpenAiHandler};

use crate::config::AgentConfig;
use crate::domain_types::AgentName;
use crate::registry::HandlerKind;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A message as seen by a handler: text plus sender metadata, nothing that
/// reaches back into kernel internals.
#[derive(Debug, Clone)]
pub struct HandlerMessage {
    /// Bus-assigned message id.
    pub id: String,
    /// Who sent it.
    pub sender: String,
    /// The text.
    pub content: String,
}

/// A handler invocation failure. The runtime requeues the trigger once,
/// then completes it with a failure marker.
#[derive(Error, Debug)]
#[error("handler failed: {message}")]
pub struct HandlerError {
    /// What went wrong.
    pub message: String,
}

impl HandlerError {
    /// Creates an error from any displayable cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The handler contract.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Produces a reply to `trigger`, or `None` to abstain.
    ///
    /// `batch` holds messages drained alongside the trigger in the same
    /// processing cycle; `history` holds recent completed messages, oldest
    /// first. Both are context only.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] if the reply cannot be produced.
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        batch: &[HandlerMessage],
        history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError>;
}

/// Everything needed to build a handler for one runtime.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    /// The agent this handler speaks for.
    pub agent: AgentName,
    /// Which variant to build.
    pub kind: HandlerKind,
    /// Provider, where the kind requires one.
    pub provider: Option<String>,
    /// Model name, where the kind requires one.
    pub model: Option<String>,
    /// Resolved system prompt text.
    pub system_prompt: Option<String>,
    /// The agent's configuration, for tool subserver wiring.
    pub agent_config: AgentConfig,
}

/// Errors from constructing a handler.
#[derive(Error, Debug)]
pub enum HandlerBuildError {
    /// A required credential is absent from the environment.
    #[error("handler kind '{kind}' needs the {variable} environment variable")]
    MissingCredential {
        /// The kind being built.
        kind: HandlerKind,
        /// Environment variable holding the credential.
        variable: &'static str,
    },

    /// The graph handler was given a provider it cannot drive.
    #[error("unknown provider '{provider}' for the graph handler")]
    UnknownProvider {
        /// The rejected provider name.
        provider: String,
    },

    /// A kind that requires a model was built without one. The supervisor
    /// validates this earlier; hitting it here is a wiring bug.
    #[error("handler kind '{kind}' built without a model")]
    MissingModel {
        /// The kind being built.
        kind: HandlerKind,
    },

    /// The local inference endpoint could not be queried.
    #[error("local model listing failed: {reason}")]
    LocalEndpoint {
        /// What went wrong.
        reason: String,
    },
}

/// Builds handlers for the supervisor. The seam tests replace with
/// scripted handlers.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    /// Builds the handler described by `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerBuildError`] if the variant cannot be assembled.
    fn build(&self, request: &HandlerRequest) -> Result<Arc<dyn Handler>, HandlerBuildError>;

    /// Model names currently accepted for `kind`, where the registry says
    /// they are enumerated at launch. `None` means no launch-time check.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerBuildError`] if the enumeration source is down.
    async fn available_models(
        &self,
        kind: HandlerKind,
    ) -> Result<Option<Vec<String>>, HandlerBuildError> {
        let _ = kind;
        Ok(None)
    }
}

/// Production factory: builds real handler variants from process settings.
pub struct DefaultHandlerFactory {
    /// Base URL of the local inference endpoint.
    pub ollama_url: String,
}

impl DefaultHandlerFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new(ollama_url: impl Into<String>) -> Self {
        Self {
            ollama_url: ollama_url.into(),
        }
    }

    fn required_model(request: &HandlerRequest) -> Result<String, HandlerBuildError> {
        request
            .model
            .clone()
            .ok_or(HandlerBuildError::MissingModel { kind: request.kind })
    }

    fn required_env(
        kind: HandlerKind,
        variable: &'static str,
    ) -> Result<String, HandlerBuildError> {
        std::env::var(variable)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(HandlerBuildError::MissingCredential { kind, variable })
    }
}

#[async_trait]
impl HandlerFactory for DefaultHandlerFactory {
    fn build(&self, request: &HandlerRequest) -> Result<Arc<dyn Handler>, HandlerBuildError> {
        match request.kind {
            HandlerKind::Echo => Ok(Arc::new(EchoHandler)),
            HandlerKind::Ollama => Ok(Arc::new(OllamaHandler::new(
                self.ollama_url.clone(),
                Self::required_model(request)?,
                request.agent.clone(),
                request.system_prompt.clone(),
            ))),
            HandlerKind::Openai => {
                let key = Self::required_env(request.kind, "OPENAI_API_KEY")?;
                Ok(Arc::new(OpenAiHandler::new(
                    key,
                    Self::required_model(request)?,
                    request.agent.clone(),
                    request.system_prompt.clone(),
                )))
            }
            HandlerKind::Anthropic => {
                let key = Self::required_env(request.kind, "ANTHROPIC_API_KEY")?;
                Ok(Arc::new(AnthropicHandler::new(
                    key,
                    Self::required_model(request)?,
                    request.agent.clone(),
                    request.system_prompt.clone(),
                )))
            }
            HandlerKind::Graph => {
                let provider = request.provider.clone().unwrap_or_default();
                GraphHandler::build(
                    &provider,
                    self.ollama_url.clone(),
                    Self::required_model(request)?,
                    request.agent.clone(),
                    request.system_prompt.clone(),
                    &request.agent_config,
                )
                .map(|h| Arc::new(h) as Arc<dyn Handler>)
            }
        }
    }

    async fn available_models(
        &self,
        kind: HandlerKind,
    ) -> Result<Option<Vec<String>>, HandlerBuildError> {
        match kind {
            HandlerKind::Ollama => local::list_models(&self.ollama_url).await.map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: HandlerKind) -> HandlerRequest {
        HandlerRequest {
            agent: AgentName::try_new("alpha".to_string()).unwrap(),
            kind,
            provider: None,
            model: Some("test-model".to_string()),
            system_prompt: None,
            agent_config: AgentConfig::default(),
        }
    }

    #[test]
    fn echo_builds_without_configuration() {
        let factory = DefaultHandlerFactory::new("http://localhost:11434");
        assert!(factory.build(&request(HandlerKind::Echo)).is_ok());
    }

    #[test]
    fn graph_rejects_unknown_providers() {
        let factory = DefaultHandlerFactory::new("http://localhost:11434");
        let mut req = request(HandlerKind::Graph);
        req.provider = Some("mainframe".to_string());
        assert!(matches!(
            factory.build(&req),
            Err(HandlerBuildError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn ollama_requires_a_model() {
        let factory = DefaultHandlerFactory::new("http://localhost:11434");
        let mut req = request(HandlerKind::Ollama);
        req.model = None;
        assert!(matches!(
            factory.build(&req),
            Err(HandlerBuildError::MissingModel { .. })
        ));
    }
}
