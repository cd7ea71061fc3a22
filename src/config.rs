//! Operator-facing configuration.
//!
//! Three layers: process settings (CLI flags with `CORRAL_*` environment
//! overrides), per-agent JSON files naming the MCP tool subservers a
//! handler may launch, and the deployments file bundling agents into
//! groups that start and stop as a unit. Agent configuration is loaded
//! once at runtime start; changing it requires a restart.

use crate::domain_types::{AgentName, GroupId};
use crate::registry::HandlerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the backlog database under the data directory.
pub const BACKLOG_DB_FILE: &str = "message_backlog.db";

/// File name of the deployment groups file under the config directory.
pub const DEPLOYMENTS_FILE: &str = "deployments.json";

/// Errors from loading configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for its expected shape.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path that failed.
        path: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A deployment group id was not found in the deployments file.
    #[error("deployment group '{id}' not found")]
    UnknownGroup {
        /// The requested group id.
        id: GroupId,
    },
}

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory for the backlog database and the kill-switch flag.
    pub data_dir: PathBuf,
    /// Directory for per-runtime log files.
    pub log_dir: PathBuf,
    /// Directory holding agent configs, prompts, and the deployments file.
    pub config_dir: PathBuf,
    /// Bind address of the control plane.
    pub http_addr: SocketAddr,
    /// Base URL of the MCP message bus.
    pub bus_url: String,
    /// Bearer token for the bus, if it requires one.
    pub bus_token: Option<String>,
    /// Environment tag used to filter available agents.
    pub environment: Option<String>,
    /// Base URL of the local inference endpoint.
    pub ollama_url: String,
}

impl Settings {
    /// Path of the backlog database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(BACKLOG_DB_FILE)
    }

    /// The directories the supervisor works out of.
    #[must_use]
    pub fn supervised_paths(&self) -> SupervisedPaths {
        SupervisedPaths {
            config_dir: self.config_dir.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}

/// The directories the supervisor reads configuration from and writes
/// runtime logs into.
#[derive(Debug, Clone)]
pub struct SupervisedPaths {
    /// Agent configs, prompts, and the deployments file.
    pub config_dir: PathBuf,
    /// Per-runtime log files.
    pub log_dir: PathBuf,
}

/// Reads a `CORRAL_*` environment override, falling back to `value`.
#[must_use]
pub fn env_or(name: &str, value: String) -> String {
    std::env::var(name).unwrap_or(value)
}

/// Reads an optional `CORRAL_*` environment variable.
#[must_use]
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// One MCP tool subserver an agent's handler may launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    /// Executable to launch.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the subserver process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Per-agent configuration file, addressed by agent name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tool subservers available to the agent's handler.
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// Handler-specific permission settings. Opaque to the kernel.
    #[serde(default)]
    pub permissions: serde_json::Value,
    /// Environment tag; agents outside the supervisor's environment are
    /// hidden from listings.
    #[serde(default)]
    pub environment: Option<String>,
}

/// An agent discovered in the config directory.
#[derive(Debug, Clone, Serialize)]
pub struct AgentListing {
    /// Agent name, from the file name.
    pub agent: AgentName,
    /// Environment tag from the config, if any.
    pub environment: Option<String>,
    /// Names of the configured tool subservers.
    pub mcp_servers: Vec<String>,
}

/// Loads one agent's configuration. A missing file yields the default
/// (no tool subservers, no environment tag).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file exists but cannot be read or
/// parsed.
pub fn load_agent_config(config_dir: &Path, agent: &AgentName) -> Result<AgentConfig, ConfigError> {
    let path = config_dir.join(format!("{agent}.json"));
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    read_json(&path)
}

/// Lists agents that have a configuration file, optionally filtered to one
/// environment tag. Untagged agents are visible in every environment.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the directory cannot be read. Unparseable
/// files are skipped.
pub fn list_agents(
    config_dir: &Path,
    environment: Option<&str>,
) -> Result<Vec<AgentListing>, ConfigError> {
    let entries = std::fs::read_dir(config_dir).map_err(|source| ConfigError::Io {
        path: config_dir.display().to_string(),
        source,
    })?;

    let mut listings = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem == "deployments" {
            continue;
        }
        let Ok(agent) = AgentName::try_new(stem.to_string()) else {
            continue;
        };
        let Ok(config) = read_json::<AgentConfig>(&path) else {
            continue;
        };
        let visible = match (environment, config.environment.as_deref()) {
            (Some(wanted), Some(tag)) => wanted == tag,
            _ => true,
        };
        if visible {
            let mut mcp_servers: Vec<String> = config.mcp_servers.keys().cloned().collect();
            mcp_servers.sort();
            listings.push(AgentListing {
                agent,
                environment: config.environment,
                mcp_servers,
            });
        }
    }
    listings.sort_by(|a, b| a.agent.as_str().cmp(b.agent.as_str()));
    Ok(listings)
}

/// Overrides one group member may apply on top of the group defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    /// Agent to launch.
    pub agent: AgentName,
    /// Handler kind override.
    #[serde(default)]
    pub handler_kind: Option<HandlerKind>,
    /// Provider override.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// System prompt name override.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// A named bundle of agents started and stopped as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentGroup {
    /// Stable identifier used by the control plane.
    pub id: GroupId,
    /// Human-readable name.
    pub name: String,
    /// Default handler kind for members without an override.
    pub handler_kind: HandlerKind,
    /// Default provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Default model.
    #[serde(default)]
    pub model: Option<String>,
    /// Default system prompt name.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// The member agents.
    #[serde(default)]
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentsFile {
    #[serde(default)]
    groups: Vec<DeploymentGroup>,
}

/// Loads all deployment groups. A missing deployments file yields none.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file exists but cannot be read or
/// parsed.
pub fn load_deployment_groups(config_dir: &Path) -> Result<Vec<DeploymentGroup>, ConfigError> {
    let path = config_dir.join(DEPLOYMENTS_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file: DeploymentsFile = read_json(&path)?;
    Ok(file.groups)
}

/// Finds one deployment group by id.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownGroup`] if no group has the id.
pub fn find_deployment_group(
    config_dir: &Path,
    id: &GroupId,
) -> Result<DeploymentGroup, ConfigError> {
    load_deployment_groups(config_dir)?
        .into_iter()
        .find(|g| &g.id == id)
        .ok_or_else(|| ConfigError::UnknownGroup { id: id.clone() })
}

/// Loads a named system prompt from `<config-dir>/prompts/<name>.md`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read.
pub fn load_system_prompt(config_dir: &Path, name: &str) -> Result<String, ConfigError> {
    let path = config_dir.join("prompts").join(format!("{name}.md"));
    std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn agent(name: &str) -> AgentName {
        AgentName::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn missing_agent_config_defaults_to_empty() {
        let dir = tempdir().unwrap();
        let config = load_agent_config(dir.path(), &agent("alpha")).unwrap();
        assert!(config.mcp_servers.is_empty());
        assert!(config.environment.is_none());
    }

    #[test]
    fn agent_config_parses_mcp_servers() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("alpha.json"),
            r#"{
                "mcpServers": {
                    "search": {"command": "mcp-search", "args": ["--fast"]}
                },
                "permissions": {"allow": ["read"]},
                "environment": "staging"
            }"#,
        )
        .unwrap();

        let config = load_agent_config(dir.path(), &agent("alpha")).unwrap();
        assert_eq!(config.mcp_servers["search"].command, "mcp-search");
        assert_eq!(config.mcp_servers["search"].args, vec!["--fast"]);
        assert_eq!(config.environment.as_deref(), Some("staging"));
    }

    #[test]
    fn listing_filters_by_environment_tag() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("alpha.json"),
            r#"{"environment": "staging"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("beta.json"), r#"{"environment": "prod"}"#).unwrap();
        std::fs::write(dir.path().join("gamma.json"), "{}").unwrap();
        std::fs::write(dir.path().join("deployments.json"), r#"{"groups": []}"#).unwrap();

        let all = list_agents(dir.path(), None).unwrap();
        assert_eq!(all.len(), 3);

        let staging = list_agents(dir.path(), Some("staging")).unwrap();
        let names: Vec<_> = staging.iter().map(|l| l.agent.to_string()).collect();
        // Untagged agents are visible everywhere.
        assert_eq!(names, ["alpha", "gamma"]);
    }

    #[test]
    fn deployment_groups_round_trip() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEPLOYMENTS_FILE),
            r#"{
                "groups": [{
                    "id": "support-pod",
                    "name": "Support pod",
                    "handler_kind": "echo",
                    "members": [
                        {"agent": "alpha"},
                        {"agent": "beta", "handler_kind": "anthropic",
                         "model": "claude-3-5-haiku-20241022"}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let group = find_deployment_group(dir.path(), &GroupId::try_new("support-pod".to_string()).unwrap())
            .unwrap();
        assert_eq!(group.members.len(), 2);
        assert_eq!(group.handler_kind, HandlerKind::Echo);
        assert_eq!(group.members[1].handler_kind, Some(HandlerKind::Anthropic));

        let missing = find_deployment_group(dir.path(), &GroupId::try_new("nope".to_string()).unwrap());
        assert!(matches!(missing, Err(ConfigError::UnknownGroup { .. })));
    }

    #[test]
    fn system_prompts_load_from_prompts_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/support.md"), "Be helpful.").unwrap();
        assert_eq!(
            load_system_prompt(dir.path(), "support").unwrap(),
            "Be helpful."
        );
        assert!(load_system_prompt(dir.path(), "absent").is_err());
    }
}
