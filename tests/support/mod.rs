//! Shared fixtures for the integration tests: a channel-backed mock bus,
//! scripted handlers, and a supervisor harness over temp directories with
//! timings tightened far below production values.

#![allow(dead_code)]

use async_trait::async_trait;
use corral::bus::{BusConnector, BusError, BusMessage, MessageBus};
use corral::config::SupervisedPaths;
use corral::database::{DatabaseConnection, DatabasePath};
use corral::domain_types::{AgentName, BatchSize, HeartbeatSeconds, HistoryLimit, MessageId};
use corral::handlers::{
    EchoHandler, Handler, HandlerBuildError, HandlerError, HandlerFactory, HandlerMessage,
    HandlerRequest,
};
use corral::kill_switch::KillSwitch;
use corral::registry::HandlerKind;
use corral::runtime::RuntimeConfig;
use corral::store::MessageStore;
use corral::supervisor::{Supervisor, SupervisorConfig};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};

pub fn agent(name: &str) -> AgentName {
    AgentName::try_new(name.to_string()).unwrap()
}

pub fn mid(id: &str) -> MessageId {
    MessageId::try_new(id.to_string()).unwrap()
}

/// A message the mock bus saw an agent publish.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub content: String,
    pub parent_id: Option<String>,
}

/// Channel-backed bus double for one agent.
pub struct MockBus {
    incoming: Mutex<mpsc::UnboundedReceiver<BusMessage>>,
    deliver: mpsc::UnboundedSender<BusMessage>,
    sent: Mutex<Vec<SentMessage>>,
    pings: AtomicU32,
    send_failures: Mutex<VecDeque<BusError>>,
    sent_seq: AtomicU64,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            incoming: Mutex::new(rx),
            deliver: tx,
            sent: Mutex::new(Vec::new()),
            pings: AtomicU32::new(0),
            send_failures: Mutex::new(VecDeque::new()),
            sent_seq: AtomicU64::new(0),
        })
    }

    /// Delivers a directed message as if it arrived on the bus.
    pub fn deliver(&self, id: &str, sender: &str, content: &str) {
        let _ = self.deliver.send(BusMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
        });
    }

    /// Everything the agent has published so far.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// Scripts the next send call to fail with `error`.
    pub async fn fail_next_send(&self, error: BusError) {
        self.send_failures.lock().await.push_back(error);
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn send(
        &self,
        content: &str,
        parent_id: Option<&MessageId>,
    ) -> Result<MessageId, BusError> {
        if let Some(error) = self.send_failures.lock().await.pop_front() {
            return Err(error);
        }
        self.sent.lock().await.push(SentMessage {
            content: content.to_string(),
            parent_id: parent_id.map(ToString::to_string),
        });
        let n = self.sent_seq.fetch_add(1, Ordering::SeqCst);
        Ok(mid(&format!("sent-{n}")))
    }

    async fn receive(
        &self,
        _wait_for_mention: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut rx = self.incoming.lock().await;
        let next = async {
            match rx.recv().await {
                Some(first) => {
                    let mut batch = vec![first];
                    while let Ok(more) = rx.try_recv() {
                        batch.push(more);
                    }
                    Some(batch)
                }
                None => None,
            }
        };
        match timeout {
            Some(window) => match tokio::time::timeout(window, next).await {
                Ok(Some(batch)) => Ok(batch),
                // Sender dropped or window elapsed: an empty poll.
                Ok(None) | Err(_) => Ok(Vec::new()),
            },
            None => match next.await {
                Some(batch) => Ok(batch),
                // Long poll with nothing left to deliver: block forever,
                // the way a real mention wait would.
                None => std::future::pending().await,
            },
        }
    }

    async fn ping(&self) -> Result<(), BusError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared `MockBus` per agent, so tests and the supervisor
/// see the same traffic.
#[derive(Default)]
pub struct MockConnector {
    buses: DashMap<AgentName, Arc<MockBus>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bus_for(&self, agent: &AgentName) -> Arc<MockBus> {
        let entry = self.buses.entry(agent.clone()).or_insert_with(MockBus::new);
        Arc::clone(entry.value())
    }
}

impl BusConnector for MockConnector {
    fn connect(&self, agent: &AgentName) -> Arc<dyn MessageBus> {
        self.bus_for(agent)
    }
}

/// Fails its first `failures` calls, then echoes.
pub struct FlakyHandler {
    calls: AtomicU32,
    failures: u32,
}

impl FlakyHandler {
    pub fn failing_once() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures: 1,
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        _batch: &[HandlerMessage],
        _history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::new("scripted failure"))
        } else {
            Ok(Some(trigger.content.clone()))
        }
    }
}

/// Replies with a fixed string, whatever the trigger says.
pub struct StaticHandler {
    pub reply: String,
}

impl StaticHandler {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
        })
    }
}

#[async_trait]
impl Handler for StaticHandler {
    async fn handle(
        &self,
        _trigger: &HandlerMessage,
        _batch: &[HandlerMessage],
        _history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        Ok(Some(self.reply.clone()))
    }
}

/// Never returns; exists to trip the supervisor watchdog.
pub struct HangingHandler;

#[async_trait]
impl Handler for HangingHandler {
    async fn handle(
        &self,
        _trigger: &HandlerMessage,
        _batch: &[HandlerMessage],
        _history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        std::future::pending().await
    }
}

/// Per-agent scripted handlers; echo for anyone not scripted.
#[derive(Default)]
pub struct MockHandlerFactory {
    handlers: DashMap<AgentName, Arc<dyn Handler>>,
}

impl MockHandlerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, agent: &AgentName, handler: Arc<dyn Handler>) {
        self.handlers.insert(agent.clone(), handler);
    }
}

#[async_trait]
impl HandlerFactory for MockHandlerFactory {
    fn build(&self, request: &HandlerRequest) -> Result<Arc<dyn Handler>, HandlerBuildError> {
        Ok(self.handlers.get(&request.agent).map_or_else(
            || Arc::new(EchoHandler) as Arc<dyn Handler>,
            |h| Arc::clone(h.value()),
        ))
    }
}

/// Runtime knobs tightened for tests: everything observable within tens of
/// milliseconds, heartbeat off unless a test turns it on.
pub fn fast_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        batch_size: BatchSize::standard(),
        history_limit: HistoryLimit::default(),
        heartbeat: HeartbeatSeconds::try_new(0).unwrap(),
        idle_poll: Duration::from_millis(10),
        state_check: Duration::from_millis(20),
        done_pause: Duration::from_millis(300),
    }
}

pub fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        startup_grace: Duration::from_secs(5),
        stop_grace: Duration::from_secs(1),
        handler_timeout: Duration::from_secs(600),
        watchdog_interval: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(3600),
        reset_max_iterations: 50,
        reset_receive_window: Duration::from_millis(50),
        runtime: fast_runtime_config(),
    }
}

/// A full supervisor over temp directories, mock bus, and scripted
/// handlers.
pub struct Harness {
    pub supervisor: Arc<Supervisor>,
    pub connector: Arc<MockConnector>,
    pub factory: Arc<MockHandlerFactory>,
    pub store: MessageStore,
    pub kill_switch: Arc<KillSwitch>,
    pub data_dir: TempDir,
    pub config_dir: TempDir,
    pub log_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(fast_supervisor_config()).await
    }

    pub async fn with_config(config: SupervisorConfig) -> Self {
        let data_dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let log_dir = TempDir::new().unwrap();

        let db_path = DatabasePath::new(data_dir.path().join("message_backlog.db")).unwrap();
        let database = DatabaseConnection::open(db_path).await.unwrap();
        let store = MessageStore::new(database);

        let kill_switch = Arc::new(KillSwitch::new(data_dir.path()));
        let connector = MockConnector::new();
        let factory = MockHandlerFactory::new();

        let supervisor = Supervisor::new(
            store.clone(),
            config,
            SupervisedPaths {
                config_dir: config_dir.path().to_path_buf(),
                log_dir: log_dir.path().to_path_buf(),
            },
            Arc::clone(&kill_switch),
            connector.clone(),
            factory.clone(),
        );

        Self {
            supervisor,
            connector,
            factory,
            store,
            kill_switch,
            data_dir,
            config_dir,
            log_dir,
        }
    }

    pub fn bus(&self, name: &str) -> Arc<MockBus> {
        self.connector.bus_for(&agent(name))
    }

    pub async fn start_echo(&self, name: &str) -> corral::domain_types::RuntimeId {
        self.supervisor
            .start(corral::supervisor::StartRequest {
                agent: agent(name),
                handler_kind: HandlerKind::Echo,
                provider: None,
                model: None,
                system_prompt: None,
                group: None,
            })
            .await
            .unwrap()
    }
}

/// Polls `probe` every 10 ms until it yields true or `deadline` passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
