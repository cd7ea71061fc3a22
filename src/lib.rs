//! # Corral: agent-fleet orchestration over an MCP message bus
//!
//! Corral connects named autonomous agents to a shared MCP message bus and
//! drives each one through a poll → process → reply loop. Every agent gets
//! a durable FIFO backlog, a three-task runtime (poller, processor,
//! heartbeat), and a threaded reply for every trigger. A single supervisor
//! owns the fleet on a host: it launches runtimes, broadcasts the kill
//! switch, resets backlogs, manages deployment groups, and exposes it all
//! through a thin HTTP/WebSocket control plane.
//!
//! ## Architecture
//!
//! Dependency order, leaves first:
//!
//! - [`store`]: durable per-agent FIFO queue over embedded `SQLite`
//! - [`bus`]: one logical connection per agent to the MCP bus
//! - [`runtime`]: the per-agent poller/processor/heartbeat loops
//! - [`supervisor`]: fleet lifecycle, kill switch, deployment groups
//! - [`control_plane`]: REST + WebSocket surface over the supervisor
//!
//! Handlers ([`handlers`]) plug into the runtime behind one trait; the
//! closed set of variants is described by the framework [`registry`].

pub mod bus;
pub mod commands;
pub mod config;
pub mod control_plane;
pub mod database;
pub mod domain_types;
pub mod handlers;
pub mod kill_switch;
pub mod log_stream;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod supervisor;

pub use bus::{BusConnector, BusError, BusMessage, HttpBusConnector, MessageBus};
pub use database::{DatabaseConnection, DatabasePath};
pub use domain_types::{AgentName, GroupId, MessageId, RuntimeId};
pub use handlers::{DefaultHandlerFactory, Handler, HandlerFactory, HandlerMessage};
pub use kill_switch::KillSwitch;
pub use registry::HandlerKind;
pub use runtime::{AgentRuntime, RuntimeConfig};
pub use store::{EnqueueOutcome, MessageStore, StoredMessage};
pub use supervisor::{StartRequest, Supervisor, SupervisorConfig};
