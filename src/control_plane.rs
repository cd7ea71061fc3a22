//! HTTP control plane.
//!
//! A thin REST surface over the supervisor plus a WebSocket that streams
//! the multiplexed runtime logs. No control logic lives here: every
//! handler parses, delegates to the supervisor, and maps the result onto
//! a status code.

use crate::config;
use crate::domain_types::{AgentName, GroupId, RuntimeId};
use crate::log_stream::{LogLine, tail_file};
use crate::registry::{self, HandlerKind};
use crate::supervisor::{Supervisor, SupervisorError, StartRequest};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Error payload for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short error summary.
    pub error: String,
    /// Detail, when there is more to say.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Body of `POST /monitors/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartMonitorRequest {
    /// Agent to launch.
    pub agent: String,
    /// Handler kind, as listed by `GET /frameworks`.
    pub handler_kind: String,
    /// Provider, where the kind requires one.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model, where the kind requires one.
    #[serde(default)]
    pub model: Option<String>,
    /// Named system prompt under the config directory.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Response of `POST /monitors/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMonitorResponse {
    /// Id of the launched runtime.
    pub runtime_id: RuntimeId,
}

/// Body of `POST /monitors/stop` and `POST /monitors/kill`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeIdRequest {
    /// Target runtime.
    pub runtime_id: RuntimeId,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    /// Always `true`.
    pub ok: bool,
}

impl OkResponse {
    fn ok() -> Json<Self> {
        Json(Self { ok: true })
    }
}

/// Response of `GET /kill-switch/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    /// Whether the switch is active.
    pub active: bool,
}

#[derive(Debug, Deserialize)]
struct EnvironmentQuery {
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    tail: Option<usize>,
}

/// Builds the control-plane router.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/frameworks", get(frameworks))
        .route("/agents", get(agents))
        .route("/agents/reset", post(reset_environment))
        .route("/agents/{name}/reset", post(reset_agent))
        .route("/monitors", get(monitors))
        .route("/monitors/start", post(start_monitor))
        .route("/monitors/stop", post(stop_monitor))
        .route("/monitors/kill", post(kill_monitor))
        .route("/monitors/stop-all", post(stop_all))
        .route("/monitors/{id}/logs", get(monitor_logs))
        .route("/kill-switch/status", get(kill_switch_status))
        .route("/kill-switch/deactivate", post(kill_switch_deactivate))
        .route("/deployments/{id}/start", post(start_deployment))
        .route("/deployments/{id}/stop", post(stop_deployment))
        .route("/logs", get(logs_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}

/// Binds and serves the control plane until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "control plane listening");
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn bad_request(error: &str, details: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
            details: Some(details.into()),
        }),
    )
        .into_response()
}

fn supervisor_error(e: &SupervisorError) -> Response {
    let status = match e {
        SupervisorError::Conflict { .. } | SupervisorError::AgentRunning { .. } => {
            StatusCode::CONFLICT
        }
        SupervisorError::Registry(_)
        | SupervisorError::UnavailableModel { .. }
        | SupervisorError::HandlerBuild(_)
        | SupervisorError::Config(_) => StatusCode::BAD_REQUEST,
        SupervisorError::UnknownRuntime { .. } => StatusCode::NOT_FOUND,
        SupervisorError::StartupTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SupervisorError::Store(_) | SupervisorError::KillSwitch(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            details: None,
        }),
    )
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn frameworks() -> Json<&'static [registry::FrameworkSpec]> {
    Json(registry::FRAMEWORKS)
}

async fn agents(
    State(supervisor): State<Arc<Supervisor>>,
    Query(query): Query<EnvironmentQuery>,
) -> Response {
    match config::list_agents(&supervisor.paths().config_dir, query.environment.as_deref()) {
        Ok(listings) => Json(listings).into_response(),
        Err(e) => bad_request("could not list agents", e.to_string()),
    }
}

async fn monitors(State(supervisor): State<Arc<Supervisor>>) -> Response {
    Json(supervisor.snapshot().await).into_response()
}

async fn start_monitor(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<StartMonitorRequest>,
) -> Response {
    let Ok(agent) = AgentName::try_new(request.agent.clone()) else {
        return bad_request("invalid agent name", request.agent);
    };
    let handler_kind: HandlerKind = match request.handler_kind.parse() {
        Ok(kind) => kind,
        Err(e) => return bad_request("invalid handler kind", format!("{e}")),
    };

    match supervisor
        .start(StartRequest {
            agent,
            handler_kind,
            provider: request.provider,
            model: request.model,
            system_prompt: request.system_prompt,
            group: None,
        })
        .await
    {
        Ok(runtime_id) => (
            StatusCode::CREATED,
            Json(StartMonitorResponse { runtime_id }),
        )
            .into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn stop_monitor(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<RuntimeIdRequest>,
) -> Response {
    match supervisor.stop(request.runtime_id).await {
        Ok(()) => OkResponse::ok().into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn kill_monitor(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<RuntimeIdRequest>,
) -> Response {
    match supervisor.kill(request.runtime_id) {
        Ok(()) => OkResponse::ok().into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn stop_all(State(supervisor): State<Arc<Supervisor>>) -> Response {
    match supervisor.activate_kill_switch().await {
        Ok(()) => OkResponse::ok().into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn kill_switch_status(State(supervisor): State<Arc<Supervisor>>) -> Json<KillSwitchStatus> {
    Json(KillSwitchStatus {
        active: supervisor.kill_switch_active(),
    })
}

async fn kill_switch_deactivate(State(supervisor): State<Arc<Supervisor>>) -> Response {
    match supervisor.deactivate_kill_switch().await {
        Ok(()) => OkResponse::ok().into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn reset_agent(
    State(supervisor): State<Arc<Supervisor>>,
    Path(name): Path<String>,
) -> Response {
    let Ok(agent) = AgentName::try_new(name.clone()) else {
        return bad_request("invalid agent name", name);
    };
    match supervisor.reset_backlog(&agent).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn reset_environment(
    State(supervisor): State<Arc<Supervisor>>,
    Query(query): Query<EnvironmentQuery>,
) -> Response {
    match supervisor
        .reset_environment(query.environment.as_deref())
        .await
    {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn start_deployment(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(group) = GroupId::try_new(id.clone()) else {
        return bad_request("invalid deployment group id", id);
    };
    match supervisor.deploy_group(&group).await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn stop_deployment(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(group) = GroupId::try_new(id.clone()) else {
        return bad_request("invalid deployment group id", id);
    };
    match supervisor.stop_group(&group).await {
        Ok(outcomes) => Json(outcomes).into_response(),
        Err(e) => supervisor_error(&e),
    }
}

async fn monitor_logs(
    State(supervisor): State<Arc<Supervisor>>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Response {
    let Ok(uuid) = id.parse::<Uuid>() else {
        return bad_request("invalid runtime id", id);
    };
    let runtime_id = RuntimeId::new(uuid);
    let Some(record) = supervisor.record(runtime_id) else {
        return supervisor_error(&SupervisorError::UnknownRuntime { runtime_id });
    };
    let path = supervisor.log_file_path(&record);
    match tail_file(&path, query.tail.unwrap_or(100)).await {
        Ok(lines) => Json(lines).into_response(),
        Err(e) => bad_request("could not read log file", e.to_string()),
    }
}

async fn logs_ws(
    State(supervisor): State<Arc<Supervisor>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = supervisor.logs().subscribe();
    ws.on_upgrade(move |socket| stream_logs(socket, rx))
}

async fn stream_logs(mut socket: WebSocket, mut rx: broadcast::Receiver<LogLine>) {
    loop {
        match rx.recv().await {
            Ok(line) => {
                let Ok(payload) = serde_json::to_string(&line) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
            }
            // A slow consumer skips lines rather than stalling runtimes.
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
