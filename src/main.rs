//! Corral server entry point: open the backlog, recover stale claims,
//! start the supervisor and control plane, and run until interrupted.

use anyhow::Result;
use clap::Parser;
use corral::bus::HttpBusConnector;
use corral::config::{self, Settings};
use corral::database::{DatabaseConnection, DatabasePath};
use corral::handlers::DefaultHandlerFactory;
use corral::kill_switch::KillSwitch;
use corral::store::{DEFAULT_STALE_CLAIM_AGE, MessageStore};
use corral::supervisor::{Supervisor, SupervisorConfig};
use corral::control_plane;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "corral",
    about = "Orchestrates a fleet of autonomous agents over an MCP message bus"
)]
struct Cli {
    /// Directory for the backlog database and the kill-switch flag.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Directory for per-runtime log files.
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Directory holding agent configs, prompts, and deployments.
    #[arg(long, default_value = "./agents")]
    config_dir: PathBuf,

    /// Control plane bind address.
    #[arg(long, default_value = "127.0.0.1:8420")]
    http_addr: SocketAddr,

    /// Base URL of the MCP message bus.
    #[arg(long, default_value = "http://localhost:8700/mcp")]
    bus_url: String,

    /// Environment tag used to filter available agents.
    #[arg(long)]
    environment: Option<String>,

    /// Base URL of the local inference endpoint.
    #[arg(long, default_value = "http://localhost:11434")]
    ollama_url: String,
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            data_dir: PathBuf::from(config::env_or(
                "CORRAL_DATA_DIR",
                self.data_dir.display().to_string(),
            )),
            log_dir: PathBuf::from(config::env_or(
                "CORRAL_LOG_DIR",
                self.log_dir.display().to_string(),
            )),
            config_dir: PathBuf::from(config::env_or(
                "CORRAL_CONFIG_DIR",
                self.config_dir.display().to_string(),
            )),
            http_addr: config::env_or("CORRAL_HTTP_ADDR", self.http_addr.to_string())
                .parse()
                .unwrap_or(self.http_addr),
            bus_url: config::env_or("CORRAL_BUS_URL", self.bus_url),
            bus_token: config::env_opt("CORRAL_BUS_TOKEN"),
            environment: config::env_opt("CORRAL_ENVIRONMENT").or(self.environment),
            ollama_url: config::env_or("CORRAL_OLLAMA_URL", self.ollama_url),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("corral=info".parse()?),
        )
        .init();

    let settings = Cli::parse().into_settings();
    info!(
        data_dir = %settings.data_dir.display(),
        bus = %settings.bus_url,
        "starting corral"
    );

    let database = DatabaseConnection::open(DatabasePath::new(settings.database_path())?).await?;
    let store = MessageStore::new(database);
    let recovered = store.recover_stale(DEFAULT_STALE_CLAIM_AGE).await?;
    if recovered > 0 {
        info!(recovered, "requeued stale in-flight messages from last run");
    }

    let kill_switch = Arc::new(KillSwitch::new(&settings.data_dir));
    if kill_switch.is_active() {
        info!("kill switch is active from a previous run; runtimes will stay parked");
    }

    let connector = Arc::new(HttpBusConnector::new(
        settings.bus_url.clone(),
        settings.bus_token.clone(),
    ));
    let handler_factory = Arc::new(DefaultHandlerFactory::new(settings.ollama_url.clone()));

    let supervisor = Supervisor::new(
        store,
        SupervisorConfig::default(),
        settings.supervised_paths(),
        kill_switch,
        connector,
        handler_factory,
    );
    supervisor.spawn_maintenance();

    let shutdown = supervisor.shutdown_token();
    let server = tokio::spawn(control_plane::serve(
        settings.http_addr,
        Arc::clone(&supervisor),
        shutdown,
    ));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    supervisor.shutdown().await;
    server.await??;
    info!("corral stopped");
    Ok(())
}
