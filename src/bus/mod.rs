//! Client-side view of the MCP message bus.
//!
//! The kernel never implements the bus; it consumes three operations
//! (send, long-poll receive, ping) through the [`MessageBus`] trait. One
//! logical connection exists per agent, so a client instance is bound to
//! its agent at construction. Ping is independent of receive: issuing a
//! ping neither disturbs nor unblocks a receive in flight.

pub mod backoff;
pub mod http_client;

pub use backoff::{Pacer, RetryPolicy};
pub use http_client::{HttpBusClient, HttpBusConnector};

use crate::domain_types::{AgentName, MessageId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A directed message as delivered by the bus.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BusMessage {
    /// Bus-assigned id, unique within the bus.
    pub id: String,
    /// Name of the agent or human that sent it.
    pub sender: String,
    /// Message text.
    pub content: String,
}

/// Errors surfaced by bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Worth retrying with backoff: rate limits, resets, timeouts.
    #[error("transient bus error: {reason}")]
    Transient {
        /// What went wrong.
        reason: String,
        /// Server-provided wait hint, honoured by the retry policy.
        retry_after: Option<Duration>,
    },

    /// Not worth retrying: auth rejection, malformed configuration.
    #[error("fatal bus error: {reason}")]
    Fatal {
        /// What went wrong.
        reason: String,
    },
}

impl BusError {
    /// Shorthand for a transient error without a wait hint.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Shorthand for a fatal error.
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Whether the retry policy should keep going.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// One agent's logical connection to the bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message as this agent. `parent_id` threads the message
    /// under an existing one. Returns the bus-assigned id.
    async fn send(
        &self,
        content: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageId, BusError>;

    /// Long-polls for messages directed at this agent.
    ///
    /// Blocks up to `timeout` (`None` lets the server pick, typically about
    /// five minutes) until at least one message is available, then returns
    /// the batch. Messages returned are considered read by the bus.
    /// Cancelling (dropping the future) must return promptly without
    /// consuming a message.
    async fn receive(
        &self,
        wait_for_mention: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Cheap liveness probe, usable concurrently with an in-flight receive.
    async fn ping(&self) -> Result<(), BusError>;

    /// Tears down and re-establishes the underlying connection. Called by
    /// the heartbeat after repeated ping failures.
    async fn reconnect(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Builds per-agent bus connections. The supervisor's seam for tests.
pub trait BusConnector: Send + Sync {
    /// Creates a bus connection authenticated as `agent`.
    fn connect(&self, agent: &AgentName) -> Arc<dyn MessageBus>;
}
