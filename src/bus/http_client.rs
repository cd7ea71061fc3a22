//! HTTP implementation of the bus connection.
//!
//! Speaks JSON-RPC 2.0 to the MCP bus endpoint: `tools/call` for sending
//! and receiving, the protocol-level `ping` for liveness. Each call is an
//! independent POST, which is what makes ping safe to issue while a
//! long-poll receive is blocked, and what makes cancelling a receive as
//! simple as dropping its future.

use super::{BusConnector, BusError, BusMessage, MessageBus, RetryPolicy};
use crate::domain_types::{AgentName, MessageId};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Timeout for send and ping calls.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP timeout for a receive when the server picks the poll window. The
/// server default is about five minutes; the slack keeps us from racing it.
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(330);

/// Extra HTTP timeout on top of an explicit receive window.
const RECEIVE_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

/// One agent's HTTP connection to the bus.
pub struct HttpBusClient {
    http: RwLock<reqwest::Client>,
    base_url: String,
    token: Option<String>,
    agent: AgentName,
    policy: RetryPolicy,
    request_seq: AtomicU64,
}

impl HttpBusClient {
    /// Creates a client authenticated as `agent` against `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>, agent: AgentName) -> Self {
        Self {
            http: RwLock::new(reqwest::Client::new()),
            base_url: base_url.into(),
            token,
            agent,
            policy: RetryPolicy::default(),
            request_seq: AtomicU64::new(1),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Issues one JSON-RPC request and returns the `result` member.
    async fn rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.request_seq.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let client = self.http.read().await.clone();
        let mut request = client.post(&self.base_url).timeout(timeout).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            return Err(classify_status(status, retry_after));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| BusError::fatal(format!("malformed bus response: {e}")))?;
        if let Some(error) = envelope.get("error") {
            return Err(BusError::fatal(format!("bus rejected call: {error}")));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Calls an MCP tool and returns the text payload of its result.
    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String, BusError> {
        let result = self
            .rpc(
                "tools/call",
                json!({ "name": tool, "arguments": arguments }),
                timeout,
            )
            .await?;

        let text = result
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|item| item.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(BusError::fatal(format!("bus tool {tool} failed: {text}")));
        }
        Ok(text)
    }
}

#[async_trait]
impl MessageBus for HttpBusClient {
    #[instrument(skip(self, content), fields(agent = %self.agent))]
    async fn send(
        &self,
        content: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageId, BusError> {
        let text = self
            .policy
            .run("send", || {
                let mut arguments = json!({
                    "agent_name": self.agent.as_str(),
                    "content": content,
                });
                if let Some(parent) = parent_id {
                    arguments["reply_to"] = json!(parent.as_str());
                }
                self.call_tool("send_chat_message", arguments, DEFAULT_CALL_TIMEOUT)
            })
            .await?;

        // The bus answers with `{"id": "…"}`; older deployments return the
        // bare id string.
        let id = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        MessageId::try_new(id).map_err(|e| BusError::fatal(format!("bus returned invalid id: {e}")))
    }

    async fn receive(
        &self,
        wait_for_mention: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<BusMessage>, BusError> {
        let http_timeout = timeout.map_or(DEFAULT_RECEIVE_TIMEOUT, |t| t + RECEIVE_TIMEOUT_SLACK);
        let text = self
            .policy
            .run("receive", || {
                let mut arguments = json!({
                    "agent_name": self.agent.as_str(),
                    "mentions_only": wait_for_mention,
                });
                if let Some(t) = timeout {
                    arguments["timeout_seconds"] = json!(t.as_secs());
                }
                self.call_tool("wait_for_mentions", arguments, http_timeout)
            })
            .await?;

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let messages: Vec<BusMessage> = serde_json::from_str(&text)
            .map_err(|e| BusError::fatal(format!("malformed message batch: {e}")))?;
        debug!(agent = %self.agent, count = messages.len(), "received directed messages");
        Ok(messages)
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.rpc("ping", json!({}), DEFAULT_CALL_TIMEOUT).await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), BusError> {
        warn!(agent = %self.agent, "rebuilding bus connection");
        *self.http.write().await = reqwest::Client::new();
        Ok(())
    }
}

/// Builds [`HttpBusClient`]s for the supervisor.
pub struct HttpBusConnector {
    base_url: String,
    token: Option<String>,
}

impl HttpBusConnector {
    /// A connector for the given bus endpoint.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
        }
    }
}

impl BusConnector for HttpBusConnector {
    fn connect(&self, agent: &AgentName) -> Arc<dyn MessageBus> {
        Arc::new(HttpBusClient::new(
            self.base_url.clone(),
            self.token.clone(),
            agent.clone(),
        ))
    }
}

fn classify_request_error(e: reqwest::Error) -> BusError {
    if e.is_timeout() || e.is_connect() {
        BusError::transient(format!("bus unreachable: {e}"))
    } else if e.is_decode() {
        BusError::fatal(format!("malformed bus response: {e}"))
    } else {
        BusError::transient(format!("bus request failed: {e}"))
    }
}

fn classify_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> BusError {
    use reqwest::StatusCode;
    match status {
        StatusCode::TOO_MANY_REQUESTS => BusError::Transient {
            reason: "bus rate limit".to_string(),
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => BusError::transient("bus request timed out"),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BusError::fatal(format!("bus auth rejected ({status})"))
        }
        s if s.is_server_error() => BusError::Transient {
            reason: format!("bus server error ({s})"),
            retry_after,
        },
        s => BusError::fatal(format!("bus refused call ({s})")),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
