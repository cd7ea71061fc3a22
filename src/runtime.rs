//! The per-agent runtime: one poller, one processor, one heartbeat.
//!
//! The three loops cooperate through the backlog store and a handful of
//! shared flags; they never hand messages to each other directly. The
//! poller's only job is to get directed messages off the bus and into the
//! store within one round-trip, no matter how long the handler is busy.
//! The processor claims from the store, drains batch context, applies
//! in-band commands, invokes the handler, and publishes the threaded
//! reply. The heartbeat keeps the bus connection alive through quiet
//! stretches and notices when it dies.
//!
//! Cancellation is broadcast through a shared token: poller and heartbeat
//! abort at their next suspension point, while the processor finishes the
//! iteration in flight, including the final send, before exiting. A
//! claim interrupted by a hard kill stays in `processing` and is requeued
//! by stale-claim recovery on the next start.

use crate::bus::{BusError, MessageBus};
use crate::commands;
use crate::domain_types::{
    AgentName, BatchSize, HeartbeatSeconds, HistoryLimit, MessageId, RuntimeId,
};
use crate::handlers::{Handler, HandlerMessage};
use crate::kill_switch::KillSwitch;
use crate::log_stream::LogSink;
use crate::store::{EnqueueOutcome, MessageStore, StoreError, StoredMessage};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive ping failures before the bus connection is rebuilt.
const PING_FAILURES_BEFORE_RECONNECT: u32 = 3;

/// Transient store errors on the hot path are retried this many times
/// before the runtime gives up and crashes.
const STORE_WRITE_RETRIES: u32 = 5;

/// Tunable knobs of one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Trigger plus batch context consumed per processing cycle.
    pub batch_size: BatchSize,
    /// Completed messages handed to the handler as history.
    pub history_limit: HistoryLimit,
    /// Liveness ping interval; zero disables the heartbeat.
    pub heartbeat: HeartbeatSeconds,
    /// Processor sleep when the backlog is empty.
    pub idle_poll: Duration,
    /// Sleep between kill-switch and pause re-checks while blocked.
    pub state_check: Duration,
    /// How long `#done` parks the agent.
    pub done_pause: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::standard(),
            history_limit: HistoryLimit::default(),
            heartbeat: HeartbeatSeconds::default(),
            idle_poll: Duration::from_millis(100),
            state_check: Duration::from_secs(2),
            done_pause: Duration::from_secs(60),
        }
    }
}

/// Commands the supervisor writes into a runtime. Pause state is owned by
/// the runtime; this channel is the only way anyone else touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCommand {
    /// Park the agent until resumed.
    Pause,
    /// Clear any pause and resume polling and processing.
    Resume,
}

/// Errors that end a runtime. The supervisor records them as a crash.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The backlog failed non-transiently.
    #[error("backlog failure: {0}")]
    Store(#[from] StoreError),

    /// The bus rejected the connection for good.
    #[error("bus failure: {0}")]
    Bus(#[from] BusError),

    /// A kernel invariant no longer holds; the runtime must not continue.
    #[error("invariant violated: {reason}")]
    Invariant {
        /// What was observed.
        reason: String,
    },
}

/// Live counters the supervisor reads for its fleet snapshot and watchdog.
#[derive(Debug, Default)]
pub struct RuntimeVitals {
    ping_failures: AtomicU32,
    last_progress_ms: AtomicI64,
}

impl RuntimeVitals {
    /// Consecutive heartbeat failures right now.
    #[must_use]
    pub fn ping_failures(&self) -> u32 {
        self.ping_failures.load(Ordering::Relaxed)
    }

    /// Epoch milliseconds of the last store progress (enqueue, claim, or
    /// complete). Zero until the runtime first makes progress.
    #[must_use]
    pub fn last_progress_ms(&self) -> i64 {
        self.last_progress_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_progress_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_ping_failure(&self) -> u32 {
        self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn reset_ping_failures(&self) {
        self.ping_failures.store(0, Ordering::Relaxed);
    }
}

/// Handles the supervisor keeps after launching a runtime.
pub struct RuntimeChannels {
    /// Writes pause and resume commands into the runtime.
    pub control: mpsc::Sender<RuntimeCommand>,
    /// Becomes `true` once the runtime is polling.
    pub ready: watch::Receiver<bool>,
    /// Shared live counters.
    pub vitals: Arc<RuntimeVitals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseState {
    Running,
    Until {
        resume_at: Instant,
        purge_on_resume: bool,
    },
    Indefinite,
}

struct RuntimeShared {
    agent: AgentName,
    runtime_id: RuntimeId,
    store: MessageStore,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn Handler>,
    kill_switch: Arc<KillSwitch>,
    config: RuntimeConfig,
    logs: Arc<LogSink>,
    cancel: CancellationToken,
    pause: Mutex<PauseState>,
    vitals: Arc<RuntimeVitals>,
    ready: watch::Sender<bool>,
}

/// One agent's runtime. Built by the supervisor, consumed by [`Self::run`].
pub struct AgentRuntime {
    shared: Arc<RuntimeShared>,
    control_rx: mpsc::Receiver<RuntimeCommand>,
}

impl AgentRuntime {
    /// Assembles a runtime and the channels the supervisor keeps.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        agent: AgentName,
        runtime_id: RuntimeId,
        store: MessageStore,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn Handler>,
        kill_switch: Arc<KillSwitch>,
        logs: Arc<LogSink>,
        config: RuntimeConfig,
        cancel: CancellationToken,
    ) -> (Self, RuntimeChannels) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = watch::channel(false);
        let vitals = Arc::new(RuntimeVitals::default());
        let shared = Arc::new(RuntimeShared {
            agent,
            runtime_id,
            store,
            bus,
            handler,
            kill_switch,
            config,
            logs,
            cancel,
            pause: Mutex::new(PauseState::Running),
            vitals: Arc::clone(&vitals),
            ready: ready_tx,
        });
        (
            Self { shared, control_rx },
            RuntimeChannels {
                control: control_tx,
                ready: ready_rx,
                vitals,
            },
        )
    }

    /// Runs the runtime to completion: recovery, ready signal, then the
    /// three loops plus the control listener until cancellation or a fatal
    /// error.
    ///
    /// # Errors
    ///
    /// Returns a [`RuntimeError`] when the runtime dies for a reason the
    /// supervisor should record as a crash.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let shared = self.shared;
        // The supervisor guarantees one runtime per agent, so any row still
        // in processing was claimed by a dead predecessor: requeue it no
        // matter how fresh the claim looks.
        let recovered = shared
            .store
            .recover_stale_for(&shared.agent, Duration::ZERO)
            .await?;
        if recovered > 0 {
            shared
                .logs
                .log(format!("requeued {recovered} stale in-flight messages"))
                .await;
        }

        shared.ready.send_replace(true);
        shared
            .logs
            .log(format!(
                "runtime {} ready for agent {}",
                shared.runtime_id, shared.agent
            ))
            .await;
        info!(agent = %shared.agent, runtime_id = %shared.runtime_id, "agent runtime started");

        let result = tokio::try_join!(
            shared.poller_loop(),
            shared.processor_loop(),
            shared.heartbeat_loop(),
            shared.control_loop(self.control_rx),
        );
        match result {
            Ok(_) => {
                shared.logs.log("runtime stopped").await;
                Ok(())
            }
            Err(e) => {
                shared.logs.log(format!("runtime failed: {e}")).await;
                Err(e)
            }
        }
    }
}

impl RuntimeShared {
    async fn sleep_or_cancel(&self, duration: Duration) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }

    /// Whether the kill switch or pause state blocks work right now.
    /// Clears an expired `#done` pause, purging the backlog the command
    /// asked to leave empty at resume.
    async fn blocked(&self) -> Result<bool, RuntimeError> {
        if self.kill_switch.is_active() {
            return Ok(true);
        }
        let mut pause = self.pause.lock().await;
        match *pause {
            PauseState::Running => Ok(false),
            PauseState::Indefinite => Ok(true),
            PauseState::Until {
                resume_at,
                purge_on_resume,
            } => {
                if Instant::now() < resume_at {
                    return Ok(true);
                }
                if purge_on_resume {
                    let purged = self.store.purge(&self.agent).await?;
                    if purged > 0 {
                        self.logs
                            .log(format!("cleared {purged} messages queued during pause"))
                            .await;
                    }
                }
                *pause = PauseState::Running;
                self.logs.log("resuming after pause").await;
                Ok(false)
            }
        }
    }

    async fn pause_indefinitely(&self, why: &str) {
        *self.pause.lock().await = PauseState::Indefinite;
        self.logs.log(format!("paused indefinitely ({why})")).await;
    }

    async fn resume(&self) {
        *self.pause.lock().await = PauseState::Running;
        self.logs.log("resumed by operator").await;
    }

    /// `#done`: clear the backlog now, park for the cool-down window, and
    /// clear again at resume so traffic that accumulated meanwhile dies too.
    async fn begin_done_pause(&self) -> Result<(), RuntimeError> {
        let purged = self.store.purge(&self.agent).await?;
        *self.pause.lock().await = PauseState::Until {
            resume_at: Instant::now() + self.config.done_pause,
            purge_on_resume: true,
        };
        self.logs
            .log(format!(
                "pausing {}s after #done, {purged} pending cleared",
                self.config.done_pause.as_secs()
            ))
            .await;
        Ok(())
    }

    /// Runs a store write, riding out momentary lock contention. Dropping
    /// the write is never an option, so persistent failure ends the
    /// runtime instead.
    async fn store_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempts < STORE_WRITE_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The poller: long-poll the bus, enqueue, repeat. Never processes,
    /// never replies.
    async fn poller_loop(&self) -> Result<(), RuntimeError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.blocked().await? {
                self.sleep_or_cancel(self.config.state_check).await;
                continue;
            }

            let batch = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                result = self.bus.receive(true, None) => match result {
                    Ok(batch) => batch,
                    Err(e @ BusError::Transient { .. }) => {
                        self.logs.verbose(format!("poll failed, backing off: {e}")).await;
                        self.sleep_or_cancel(self.config.state_check).await;
                        continue;
                    }
                    Err(fatal) => {
                        warn!(agent = %self.agent, error = %fatal, "poller giving up");
                        return Err(fatal.into());
                    }
                },
            };

            for message in batch {
                let Ok(id) = MessageId::try_new(message.id.clone()) else {
                    self.logs
                        .log(format!(
                            "dropping message with unusable id from {}",
                            message.sender
                        ))
                        .await;
                    continue;
                };
                match self
                    .store_retry(|| {
                        self.store
                            .enqueue(&id, &self.agent, &message.sender, &message.content)
                    })
                    .await?
                {
                    EnqueueOutcome::Accepted => {
                        self.vitals.touch();
                        self.logs
                            .log(format!("queued {id} from {}", message.sender))
                            .await;
                    }
                    EnqueueOutcome::Duplicate => {
                        self.logs.verbose(format!("duplicate {id} ignored")).await;
                    }
                }
            }
        }
    }

    /// The processor: claim, drain context, apply commands, invoke the
    /// handler, publish the threaded reply, complete the batch.
    async fn processor_loop(&self) -> Result<(), RuntimeError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.blocked().await? {
                self.sleep_or_cancel(self.config.state_check).await;
                continue;
            }

            let claimed = match self.store.claim(&self.agent).await {
                Ok(claimed) => claimed,
                Err(e) if e.is_transient() => {
                    self.sleep_or_cancel(self.config.idle_poll).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let Some(trigger) = claimed else {
                self.sleep_or_cancel(self.config.idle_poll).await;
                continue;
            };
            self.vitals.touch();

            let in_flight = self.store.processing_count(&self.agent).await?;
            if in_flight > 1 {
                return Err(RuntimeError::Invariant {
                    reason: format!("{in_flight} messages in processing for {}", self.agent),
                });
            }

            let batch = self
                .store
                .drain_batch(&self.agent, self.config.batch_size.drain_limit())
                .await?;
            self.logs
                .log(format!(
                    "processing {} from {} (+{} batched)",
                    trigger.id,
                    trigger.sender,
                    batch.len()
                ))
                .await;

            // Commands in the trigger change state before the handler runs.
            let incoming = commands::scan(&trigger.content);
            if incoming.pause {
                self.pause_indefinitely("commanded by incoming message").await;
            }
            if incoming.done {
                self.begin_done_pause().await?;
            }

            if self.process_one(&trigger, &batch).await? {
                self.store_retry(|| self.store.complete(&trigger.id, &self.agent))
                    .await?;
                for subsumed in &batch {
                    self.store_retry(|| self.store.complete(&subsumed.id, &self.agent))
                        .await?;
                }
                self.vitals.touch();
            }
        }
    }

    /// Handler invocation and reply publication for one claimed trigger.
    /// Returns whether the trigger (and its batch) should be completed.
    async fn process_one(
        &self,
        trigger: &StoredMessage,
        batch: &[StoredMessage],
    ) -> Result<bool, RuntimeError> {
        let history_rows = self
            .store
            .history(&self.agent, self.config.history_limit.into_inner())
            .await?;
        let handler_trigger = to_handler_message(trigger);
        let handler_batch: Vec<HandlerMessage> = batch.iter().map(to_handler_message).collect();
        let handler_history: Vec<HandlerMessage> =
            history_rows.iter().map(to_handler_message).collect();

        let outcome = self
            .handler
            .handle(&handler_trigger, &handler_batch, &handler_history)
            .await;

        let raw = match outcome {
            Err(e) => {
                // One requeue per trigger; the second failure completes it
                // with a failure marker and the loop moves on.
                let requeue = trigger.retry_count == 0;
                self.logs
                    .log(format!(
                        "handler failed on {}: {e} ({})",
                        trigger.id,
                        if requeue { "requeueing once" } else { "giving up" }
                    ))
                    .await;
                self.store_retry(|| self.store.fail(&trigger.id, &self.agent, requeue))
                    .await?;
                return Ok(false);
            }
            Ok(None) => {
                self.logs
                    .verbose(format!("handler abstained on {}", trigger.id))
                    .await;
                return Ok(true);
            }
            Ok(Some(raw)) => raw,
        };

        // Commands in the agent's own reply: same transitions, and the
        // recognised tokens never reach the bus. A reply that carried
        // #done additionally loses its mentions so the parked agent does
        // not provoke traffic it will never read.
        let outgoing = commands::scan(&raw);
        let mut response = commands::strip_commands(&raw);
        if outgoing.pause {
            self.pause_indefinitely("commanded by own response").await;
        }
        if outgoing.done {
            self.begin_done_pause().await?;
            response = commands::strip_mentions(&response);
        }
        let response = commands::strip_leading_self_mentions(&response, self.agent.as_str());

        if response.trim().is_empty() {
            self.logs
                .verbose("reply empty after command hygiene; not publishing")
                .await;
            return Ok(true);
        }

        // A trigger the agent somehow sent itself must not become its own
        // thread parent.
        let parent = if trigger.sender == self.agent.as_str() {
            debug!(agent = %self.agent, "self-sent trigger; publishing unthreaded");
            None
        } else {
            Some(&trigger.id)
        };

        match self.bus.send(&response, parent).await {
            Ok(sent_id) => {
                self.logs
                    .log(format!("replied to {} as {sent_id}", trigger.id))
                    .await;
                Ok(true)
            }
            Err(e @ BusError::Transient { .. }) => {
                self.logs
                    .log(format!("send deferred, requeueing {}: {e}", trigger.id))
                    .await;
                self.store_retry(|| self.store.fail(&trigger.id, &self.agent, true))
                    .await?;
                self.sleep_or_cancel(self.config.state_check).await;
                Ok(false)
            }
            Err(BusError::Fatal { reason }) => {
                self.logs
                    .log(format!("send failed for {}: {reason}", trigger.id))
                    .await;
                self.store_retry(|| self.store.fail(&trigger.id, &self.agent, false))
                    .await?;
                Ok(false)
            }
        }
    }

    /// The heartbeat: ping on an interval, rebuild the connection after
    /// repeated failures. Keeps streaming connections alive past upstream
    /// idle timeouts; never touches messages.
    async fn heartbeat_loop(&self) -> Result<(), RuntimeError> {
        if self.config.heartbeat.is_disabled() {
            self.cancel.cancelled().await;
            return Ok(());
        }
        let interval = self.config.heartbeat.interval();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(interval) => {}
            }
            match self.bus.ping().await {
                Ok(()) => {
                    self.vitals.reset_ping_failures();
                    self.logs.verbose("ping ok").await;
                }
                Err(e) => {
                    let failures = self.vitals.record_ping_failure();
                    self.logs
                        .log(format!("ping failed ({failures} consecutive): {e}"))
                        .await;
                    if failures >= PING_FAILURES_BEFORE_RECONNECT {
                        match self.bus.reconnect().await {
                            Ok(()) => {
                                self.vitals.reset_ping_failures();
                                self.logs.log("bus connection rebuilt").await;
                            }
                            Err(re) => {
                                self.logs.log(format!("reconnect failed: {re}")).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Listens for supervisor commands. The pause state is owned here; the
    /// supervisor only ever writes it through this channel.
    async fn control_loop(
        &self,
        mut rx: mpsc::Receiver<RuntimeCommand>,
    ) -> Result<(), RuntimeError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                command = rx.recv() => match command {
                    Some(RuntimeCommand::Pause) => self.pause_indefinitely("operator").await,
                    Some(RuntimeCommand::Resume) => self.resume().await,
                    None => return Ok(()),
                },
            }
        }
    }
}

fn to_handler_message(message: &StoredMessage) -> HandlerMessage {
    HandlerMessage {
        id: message.id.to_string(),
        sender: message.sender.clone(),
        content: message.content.clone(),
    }
}
