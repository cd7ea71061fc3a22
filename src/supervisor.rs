//! The fleet supervisor.
//!
//! Owns every agent runtime on this host: launches them as tasks, tracks
//! their lifecycle records, broadcasts the kill switch, resets backlogs,
//! starts and stops deployment groups, and watches for runtimes that have
//! stopped making progress. Runtimes are held by value and steered only
//! through typed control messages; the supervisor never reaches into
//! another runtime's state directly.

use crate::bus::{BusConnector, Pacer};
use crate::config::{self, ConfigError, DeploymentGroup, SupervisedPaths};
use crate::domain_types::{AgentName, GroupId, RuntimeId};
use crate::handlers::{HandlerBuildError, HandlerFactory, HandlerRequest};
use crate::kill_switch::KillSwitch;
use crate::log_stream::LogMultiplexer;
use crate::registry::{self, HandlerKind, ModelSource, RegistryError};
use crate::runtime::{
    AgentRuntime, RuntimeCommand, RuntimeConfig, RuntimeError, RuntimeVitals,
};
use crate::store::{BacklogStats, MessageStore, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Supervisor-level tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a launched runtime may take to signal ready.
    pub startup_grace: Duration,
    /// How long a cooperative stop may take before the task is aborted.
    pub stop_grace: Duration,
    /// A runtime holding a claim with no store progress for this long is
    /// killed by the watchdog.
    pub handler_timeout: Duration,
    /// Watchdog scan interval.
    pub watchdog_interval: Duration,
    /// Retention sweep interval.
    pub sweep_interval: Duration,
    /// Upper bound on remote-drain iterations during a backlog reset.
    pub reset_max_iterations: u32,
    /// Poll window per remote-drain iteration.
    pub reset_receive_window: Duration,
    /// Knobs handed to every runtime.
    pub runtime: RuntimeConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            handler_timeout: Duration::from_secs(10 * 60),
            watchdog_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60 * 60),
            reset_max_iterations: 200,
            reset_receive_window: Duration::from_secs(2),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Lifecycle state of one launched runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    /// Launched, not yet polling.
    Starting,
    /// Polling and processing.
    Running,
    /// Parked by an operator or a command.
    Paused,
    /// Exited cleanly or was terminated.
    Stopped,
    /// Exited with an error; will not restart without operator action.
    Crashed,
}

impl RuntimeStatus {
    fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }
}

/// One runtime's lifecycle record. Created at launch, removed on delete
/// or supervisor shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRecord {
    /// Unique id of this launch.
    pub runtime_id: RuntimeId,
    /// Agent the runtime speaks for.
    pub agent: AgentName,
    /// Handler variant driving it.
    pub handler_kind: HandlerKind,
    /// Provider, where the kind takes one.
    pub provider: Option<String>,
    /// Model, where the kind takes one.
    pub model: Option<String>,
    /// Name of the system prompt in use.
    pub system_prompt: Option<String>,
    /// Deployment group this launch belongs to, if any.
    pub group: Option<GroupId>,
    /// Current status.
    pub status: RuntimeStatus,
    /// When the runtime was launched.
    pub started_at: DateTime<Utc>,
    /// Last error line, for crashed runtimes.
    pub last_error: Option<String>,
}

struct RuntimeHandle {
    cancel: CancellationToken,
    control: mpsc::Sender<RuntimeCommand>,
    vitals: Arc<RuntimeVitals>,
    abort: AbortHandle,
    agent: AgentName,
}

/// A launch request, as validated against the framework registry.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Agent to launch.
    pub agent: AgentName,
    /// Handler variant.
    pub handler_kind: HandlerKind,
    /// Provider, where required.
    pub provider: Option<String>,
    /// Model, where required.
    pub model: Option<String>,
    /// Name of a system prompt under the config directory.
    pub system_prompt: Option<String>,
    /// Deployment group attribution.
    pub group: Option<GroupId>,
}

/// Outcome of a backlog reset.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResetReport {
    /// Pending rows deleted from the store.
    pub purged: u64,
    /// Messages drained from the bus.
    pub drained: usize,
}

/// Per-member outcome of a deployment group operation.
#[derive(Debug, Serialize)]
pub struct MemberOutcome {
    /// The member agent.
    pub agent: AgentName,
    /// Runtime id on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<RuntimeId>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fleet snapshot served by the control plane.
#[derive(Debug, Serialize)]
pub struct FleetSnapshot {
    /// One entry per known runtime.
    pub monitors: Vec<MonitorView>,
    /// Whether the kill switch is active.
    pub kill_switch_active: bool,
}

/// One runtime as shown to operators.
#[derive(Debug, Serialize)]
pub struct MonitorView {
    /// The lifecycle record.
    #[serde(flatten)]
    pub record: LifecycleRecord,
    /// Consecutive heartbeat failures.
    pub ping_failures: u32,
    /// Queue depth and throughput, when the store is reachable.
    pub backlog: Option<BacklogStats>,
}

/// Errors from supervisor operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The agent already has an active runtime.
    #[error("agent '{agent}' already has an active runtime")]
    Conflict {
        /// The conflicting agent.
        agent: AgentName,
    },

    /// The launch request failed registry validation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The model is not served by the launch-time enumeration source.
    #[error("model '{model}' is not available for handler kind '{kind}'")]
    UnavailableModel {
        /// The requested kind.
        kind: HandlerKind,
        /// The rejected model.
        model: String,
    },

    /// The handler could not be built.
    #[error(transparent)]
    HandlerBuild(#[from] HandlerBuildError),

    /// Configuration files could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No runtime has this id.
    #[error("runtime '{runtime_id}' not found")]
    UnknownRuntime {
        /// The unknown id.
        runtime_id: RuntimeId,
    },

    /// The operation requires the agent to be stopped first.
    #[error("agent '{agent}' is running; stop it before resetting")]
    AgentRunning {
        /// The running agent.
        agent: AgentName,
    },

    /// The runtime never signalled ready.
    #[error("runtime for '{agent}' did not become ready within {seconds}s")]
    StartupTimeout {
        /// The agent being launched.
        agent: AgentName,
        /// The grace period that elapsed.
        seconds: u64,
    },

    /// The backlog store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The kill-switch flag file could not be written or removed.
    #[error("kill switch file error: {0}")]
    KillSwitch(#[from] std::io::Error),
}

/// The supervisor. One per host; owns all runtimes.
pub struct Supervisor {
    records: DashMap<RuntimeId, LifecycleRecord>,
    handles: DashMap<RuntimeId, RuntimeHandle>,
    store: MessageStore,
    config: SupervisorConfig,
    paths: SupervisedPaths,
    kill_switch: Arc<KillSwitch>,
    logs: LogMultiplexer,
    connector: Arc<dyn BusConnector>,
    handler_factory: Arc<dyn HandlerFactory>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Assembles a supervisor over an open store.
    #[must_use]
    pub fn new(
        store: MessageStore,
        config: SupervisorConfig,
        paths: SupervisedPaths,
        kill_switch: Arc<KillSwitch>,
        connector: Arc<dyn BusConnector>,
        handler_factory: Arc<dyn HandlerFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            handles: DashMap::new(),
            store,
            config,
            paths,
            kill_switch,
            logs: LogMultiplexer::new(),
            connector,
            handler_factory,
            shutdown: CancellationToken::new(),
        })
    }

    /// The shared log multiplexer.
    #[must_use]
    pub fn logs(&self) -> &LogMultiplexer {
        &self.logs
    }

    /// The configuration directory paths in use.
    #[must_use]
    pub fn paths(&self) -> &SupervisedPaths {
        &self.paths
    }

    /// Token cancelled when the supervisor shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn active_runtime_for(&self, agent: &AgentName) -> Option<RuntimeId> {
        self.records.iter().find_map(|entry| {
            (entry.agent == *agent && entry.status.is_active()).then_some(entry.runtime_id)
        })
    }

    /// Whether the agent currently has an active runtime.
    #[must_use]
    pub fn agent_running(&self, agent: &AgentName) -> bool {
        self.active_runtime_for(agent).is_some()
    }

    /// Path of a runtime's log file.
    #[must_use]
    pub fn log_file_path(&self, record: &LifecycleRecord) -> PathBuf {
        self.paths.log_dir.join(format!(
            "{}_{}_{}.log",
            record.agent, record.handler_kind, record.runtime_id
        ))
    }

    /// Looks up one lifecycle record.
    #[must_use]
    pub fn record(&self, runtime_id: RuntimeId) -> Option<LifecycleRecord> {
        self.records.get(&runtime_id).map(|r| r.value().clone())
    }

    fn set_status(&self, runtime_id: RuntimeId, status: RuntimeStatus, last_error: Option<String>) {
        if let Some(mut record) = self.records.get_mut(&runtime_id) {
            record.status = status;
            if last_error.is_some() {
                record.last_error = last_error;
            }
        }
    }

    /// Transitions an active record to `Stopped`; terminal statuses (a
    /// crash recorded by the monitor or watchdog) are left alone.
    fn mark_stopped(&self, runtime_id: RuntimeId) {
        if let Some(mut record) = self.records.get_mut(&runtime_id)
            && record.status.is_active()
        {
            record.status = RuntimeStatus::Stopped;
        }
    }

    /// Launches a runtime for `request.agent`.
    ///
    /// Validates against the framework registry (and, for locally-served
    /// models, against the live endpoint), builds the handler, spawns the
    /// runtime task, and waits for its ready signal.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] if the agent is already running, the
    /// request fails validation, or the runtime never becomes ready.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> Result<RuntimeId, SupervisorError> {
        if self.active_runtime_for(&request.agent).is_some() {
            return Err(SupervisorError::Conflict {
                agent: request.agent,
            });
        }
        registry::validate(
            request.handler_kind,
            request.provider.as_deref(),
            request.model.as_deref(),
        )?;

        let spec = registry::spec_for(request.handler_kind);
        if spec.models == ModelSource::LocalEndpoint
            && let Some(served) = self
                .handler_factory
                .available_models(request.handler_kind)
                .await?
            && let Some(model) = request.model.as_deref()
            && !served.iter().any(|m| m == model)
        {
            return Err(SupervisorError::UnavailableModel {
                kind: request.handler_kind,
                model: model.to_string(),
            });
        }

        let agent_config = config::load_agent_config(&self.paths.config_dir, &request.agent)?;
        let system_prompt = request
            .system_prompt
            .as_deref()
            .map(|name| config::load_system_prompt(&self.paths.config_dir, name))
            .transpose()?;

        let handler = self.handler_factory.build(&HandlerRequest {
            agent: request.agent.clone(),
            kind: request.handler_kind,
            provider: request.provider.clone(),
            model: request.model.clone(),
            system_prompt,
            agent_config,
        })?;

        let runtime_id = RuntimeId::generate();
        let record = LifecycleRecord {
            runtime_id,
            agent: request.agent.clone(),
            handler_kind: request.handler_kind,
            provider: request.provider,
            model: request.model,
            system_prompt: request.system_prompt,
            group: request.group,
            status: RuntimeStatus::Starting,
            started_at: Utc::now(),
            last_error: None,
        };

        let cancel = self.shutdown.child_token();
        let bus = self.connector.connect(&request.agent);
        let logs = self
            .logs
            .sink(runtime_id, self.log_file_path(&record))
            .await;
        let (runtime, channels) = AgentRuntime::new(
            request.agent.clone(),
            runtime_id,
            self.store.clone(),
            bus,
            handler,
            Arc::clone(&self.kill_switch),
            logs,
            self.config.runtime.clone(),
            cancel.clone(),
        );

        let join = tokio::spawn(runtime.run());
        let abort = join.abort_handle();
        self.records.insert(runtime_id, record);
        self.handles.insert(
            runtime_id,
            RuntimeHandle {
                cancel: cancel.clone(),
                control: channels.control,
                vitals: channels.vitals,
                abort,
                agent: request.agent.clone(),
            },
        );
        self.spawn_monitor(runtime_id, join);

        if self.await_ready(channels.ready).await {
            self.set_status(runtime_id, RuntimeStatus::Running, None);
            info!(agent = %request.agent, runtime_id = %runtime_id, "runtime running");
            Ok(runtime_id)
        } else {
            warn!(agent = %request.agent, "runtime missed its startup grace; killing it");
            cancel.cancel();
            if let Some(handle) = self.handles.get(&runtime_id) {
                handle.abort.abort();
            }
            let seconds = self.config.startup_grace.as_secs();
            self.set_status(
                runtime_id,
                RuntimeStatus::Crashed,
                Some(format!("not ready within {seconds}s")),
            );
            Err(SupervisorError::StartupTimeout {
                agent: request.agent,
                seconds,
            })
        }
    }

    async fn await_ready(&self, mut ready: tokio::sync::watch::Receiver<bool>) -> bool {
        tokio::time::timeout(self.config.startup_grace, ready.wait_for(|r| *r))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        runtime_id: RuntimeId,
        join: tokio::task::JoinHandle<Result<(), RuntimeError>>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = join.await;
            match outcome {
                Ok(Ok(())) => supervisor.mark_stopped(runtime_id),
                Ok(Err(e)) => {
                    error!(runtime_id = %runtime_id, error = %e, "runtime crashed");
                    supervisor.set_status(
                        runtime_id,
                        RuntimeStatus::Crashed,
                        Some(e.to_string()),
                    );
                }
                Err(join_error) if join_error.is_cancelled() => {
                    supervisor.mark_stopped(runtime_id);
                }
                Err(join_error) => {
                    error!(runtime_id = %runtime_id, error = %join_error, "runtime task panicked");
                    supervisor.set_status(
                        runtime_id,
                        RuntimeStatus::Crashed,
                        Some(format!("task panicked: {join_error}")),
                    );
                }
            }
        });
    }

    /// Stops a runtime cooperatively, escalating to a hard abort after the
    /// stop grace.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownRuntime`] if no runtime has the id.
    pub async fn stop(&self, runtime_id: RuntimeId) -> Result<(), SupervisorError> {
        let handle = self
            .handles
            .get(&runtime_id)
            .ok_or(SupervisorError::UnknownRuntime { runtime_id })?;
        handle.cancel.cancel();
        let abort = handle.abort.clone();
        drop(handle);

        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        loop {
            if let Some(record) = self.record(runtime_id)
                && !record.status.is_active()
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(runtime_id = %runtime_id, "stop grace elapsed; aborting runtime task");
                abort.abort();
                self.mark_stopped(runtime_id);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Terminates a runtime immediately, without grace.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownRuntime`] if no runtime has the id.
    pub fn kill(&self, runtime_id: RuntimeId) -> Result<(), SupervisorError> {
        let handle = self
            .handles
            .get(&runtime_id)
            .ok_or(SupervisorError::UnknownRuntime { runtime_id })?;
        handle.cancel.cancel();
        handle.abort.abort();
        drop(handle);
        self.mark_stopped(runtime_id);
        Ok(())
    }

    /// Activates the kill switch. Every runtime observes it within two
    /// seconds and stops polling and processing; all stay alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag file cannot be written.
    pub async fn activate_kill_switch(&self) -> Result<(), SupervisorError> {
        self.kill_switch.activate().await?;
        Ok(())
    }

    /// Clears the kill switch; runtimes resume within two seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the flag file cannot be removed.
    pub async fn deactivate_kill_switch(&self) -> Result<(), SupervisorError> {
        self.kill_switch.deactivate().await?;
        Ok(())
    }

    /// Whether the kill switch is active.
    #[must_use]
    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.is_active()
    }

    /// Parks one runtime through its control channel.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownRuntime`] if no runtime has the id.
    pub async fn pause(&self, runtime_id: RuntimeId) -> Result<(), SupervisorError> {
        self.send_command(runtime_id, RuntimeCommand::Pause).await?;
        self.set_status(runtime_id, RuntimeStatus::Paused, None);
        Ok(())
    }

    /// Resumes a parked runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownRuntime`] if no runtime has the id.
    pub async fn resume(&self, runtime_id: RuntimeId) -> Result<(), SupervisorError> {
        self.send_command(runtime_id, RuntimeCommand::Resume).await?;
        self.set_status(runtime_id, RuntimeStatus::Running, None);
        Ok(())
    }

    async fn send_command(
        &self,
        runtime_id: RuntimeId,
        command: RuntimeCommand,
    ) -> Result<(), SupervisorError> {
        let control = self
            .handles
            .get(&runtime_id)
            .ok_or(SupervisorError::UnknownRuntime { runtime_id })?
            .control
            .clone();
        // A full or closed channel means the runtime is already gone; the
        // monitor records that separately.
        let _ = control.send(command).await;
        Ok(())
    }

    /// Purges the agent's backlog and drains its unread bus messages.
    /// Refused while the agent has an active runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] if the agent is running or the store
    /// fails.
    pub async fn reset_backlog(&self, agent: &AgentName) -> Result<ResetReport, SupervisorError> {
        if self.agent_running(agent) {
            return Err(SupervisorError::AgentRunning {
                agent: agent.clone(),
            });
        }

        let purged = self.store.purge(agent).await?;

        // Remote drain: short receive windows until the bus runs dry,
        // paced under the rate limit and bounded in iterations.
        let bus = self.connector.connect(agent);
        let pacer = Pacer::bus_safe();
        let mut drained = 0usize;
        for _ in 0..self.config.reset_max_iterations {
            pacer.pace().await;
            match bus
                .receive(false, Some(self.config.reset_receive_window))
                .await
            {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => drained += batch.len(),
                Err(e) => {
                    warn!(agent = %agent, error = %e, "remote drain stopped early");
                    break;
                }
            }
        }

        info!(agent = %agent, purged, drained, "backlog reset");
        Ok(ResetReport { purged, drained })
    }

    /// Resets every not-running agent visible in `environment`. Running
    /// agents are reported as conflicts, not skipped silently.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] if the agent listing cannot be read.
    pub async fn reset_environment(
        &self,
        environment: Option<&str>,
    ) -> Result<Vec<MemberOutcome>, SupervisorError> {
        let listings = config::list_agents(&self.paths.config_dir, environment)?;
        let mut outcomes = Vec::with_capacity(listings.len());
        for listing in listings {
            let outcome = match self.reset_backlog(&listing.agent).await {
                Ok(_) => MemberOutcome {
                    agent: listing.agent,
                    runtime_id: None,
                    error: None,
                },
                Err(e) => MemberOutcome {
                    agent: listing.agent,
                    runtime_id: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn member_request(group: &DeploymentGroup, index: usize) -> StartRequest {
        let member = &group.members[index];
        StartRequest {
            agent: member.agent.clone(),
            handler_kind: member.handler_kind.unwrap_or(group.handler_kind),
            provider: member.provider.clone().or_else(|| group.provider.clone()),
            model: member.model.clone().or_else(|| group.model.clone()),
            system_prompt: member
                .system_prompt
                .clone()
                .or_else(|| group.system_prompt.clone()),
            group: Some(group.id.clone()),
        }
    }

    /// Starts every member of a deployment group, tolerating individual
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] if the group cannot be loaded.
    pub async fn deploy_group(
        self: &Arc<Self>,
        id: &GroupId,
    ) -> Result<Vec<MemberOutcome>, SupervisorError> {
        let group = config::find_deployment_group(&self.paths.config_dir, id)?;
        let mut outcomes = Vec::with_capacity(group.members.len());
        for index in 0..group.members.len() {
            let request = Self::member_request(&group, index);
            let agent = request.agent.clone();
            let outcome = match self.start(request).await {
                Ok(runtime_id) => MemberOutcome {
                    agent,
                    runtime_id: Some(runtime_id),
                    error: None,
                },
                Err(e) => MemberOutcome {
                    agent,
                    runtime_id: None,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Stops every running member of a deployment group.
    ///
    /// # Errors
    ///
    /// Returns a [`SupervisorError`] if the group cannot be loaded.
    pub async fn stop_group(&self, id: &GroupId) -> Result<Vec<MemberOutcome>, SupervisorError> {
        let group = config::find_deployment_group(&self.paths.config_dir, id)?;
        let mut outcomes = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let outcome = match self.active_runtime_for(&member.agent) {
                Some(runtime_id) => match self.stop(runtime_id).await {
                    Ok(()) => MemberOutcome {
                        agent: member.agent.clone(),
                        runtime_id: Some(runtime_id),
                        error: None,
                    },
                    Err(e) => MemberOutcome {
                        agent: member.agent.clone(),
                        runtime_id: Some(runtime_id),
                        error: Some(e.to_string()),
                    },
                },
                None => MemberOutcome {
                    agent: member.agent.clone(),
                    runtime_id: None,
                    error: Some("not running".to_string()),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// The fleet as operators see it. While the kill switch is active,
    /// running runtimes are reported paused.
    pub async fn snapshot(&self) -> FleetSnapshot {
        let kill_switch_active = self.kill_switch_active();
        // Clone out of the map before touching the store, so no shard lock
        // is held across an await.
        let records: Vec<LifecycleRecord> =
            self.records.iter().map(|e| e.value().clone()).collect();
        let mut monitors = Vec::with_capacity(records.len());
        for mut record in records {
            if kill_switch_active && record.status == RuntimeStatus::Running {
                record.status = RuntimeStatus::Paused;
            }
            let ping_failures = self
                .handles
                .get(&record.runtime_id)
                .map_or(0, |h| h.vitals.ping_failures());
            let backlog = self.store.stats(&record.agent).await.ok();
            monitors.push(MonitorView {
                record,
                ping_failures,
                backlog,
            });
        }
        monitors.sort_by(|a, b| a.record.started_at.cmp(&b.record.started_at));
        FleetSnapshot {
            monitors,
            kill_switch_active,
        }
    }

    /// Spawns the maintenance task: watchdog scans plus the periodic
    /// retention sweep. Lives until supervisor shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_sweep = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    () = supervisor.shutdown.cancelled() => return,
                    () = tokio::time::sleep(supervisor.config.watchdog_interval) => {}
                }
                supervisor.watchdog_tick().await;
                if last_sweep.elapsed() >= supervisor.config.sweep_interval {
                    last_sweep = tokio::time::Instant::now();
                    loop {
                        match supervisor.store.sweep_completed().await {
                            Ok(swept) if swept >= crate::store::SWEEP_BATCH_LIMIT as u64 => {}
                            Ok(_) => break,
                            Err(e) => {
                                warn!(error = %e, "retention sweep failed");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Kills runtimes that hold a claim but have made no store progress
    /// for the handler timeout.
    async fn watchdog_tick(&self) {
        let now = Utc::now().timestamp_millis();
        let timeout_ms = i64::try_from(self.config.handler_timeout.as_millis()).unwrap_or(i64::MAX);
        let candidates: Vec<(RuntimeId, AgentName)> = self
            .handles
            .iter()
            .filter_map(|entry| {
                let record = self.records.get(entry.key())?;
                if record.status != RuntimeStatus::Running {
                    return None;
                }
                let last = entry.vitals.last_progress_ms();
                (last > 0 && now - last > timeout_ms)
                    .then(|| (record.runtime_id, entry.agent.clone()))
            })
            .collect();

        for (runtime_id, agent) in candidates {
            let stuck = self
                .store
                .processing_count(&agent)
                .await
                .map(|n| n > 0)
                .unwrap_or(false);
            if !stuck {
                continue;
            }
            warn!(runtime_id = %runtime_id, agent = %agent, "watchdog killing stalled runtime");
            if self.kill(runtime_id).is_ok() {
                self.set_status(
                    runtime_id,
                    RuntimeStatus::Crashed,
                    Some("killed by watchdog: handler made no progress".to_string()),
                );
            }
        }
    }

    /// Shuts the whole fleet down: broadcast cancellation, wait out the
    /// stop grace, abort stragglers.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + self.config.stop_grace;
        loop {
            let active = self
                .records
                .iter()
                .filter(|r| r.status.is_active())
                .count();
            if active == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for handle in &self.handles {
            handle.abort.abort();
        }
        for mut record in self.records.iter_mut() {
            if record.status.is_active() {
                record.status = RuntimeStatus::Stopped;
            }
        }
    }
}
