//! Layered `ServerConfig` (file + environment + CLI overrides) built on the
//! `config` crate, with sane defaults so a config-free invocation still
//! starts up.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub workspace_dir: PathBuf,
    pub enable_anti_echo: bool,
    pub idle_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    pub lock_sweep_interval_secs: u64,
    pub metrics_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            workspace_dir: PathBuf::from("./agent-hub-workspace"),
            enable_anti_echo: false,
            idle_timeout_secs: 5 * 60,
            idle_sweep_interval_secs: 60,
            lock_sweep_interval_secs: 1,
            metrics_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs as i64)
    }

    /// Directories created under the workspace root on init (§6 on-disk
    /// layout: `tasks/`, `messages/`, `memory/`, `decisions/`).
    pub fn scaffold_dirs(&self) -> Vec<PathBuf> {
        ["tasks", "messages", "memory", "decisions"]
            .iter()
            .map(|d| self.workspace_dir.join(d))
            .collect()
    }

    /// Layer a TOML config file over defaults, then environment variables
    /// prefixed `AGENT_HUB_` (e.g. `AGENT_HUB_PORT=9000`).
    pub fn load(config_path: Option<&std::path::Path>) -> HubResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&ServerConfig::default()).map_err(|e| {
                HubError::Config(format!("failed to seed config defaults: {e}"))
            })?);

        if let Some(path) = config_path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AGENT_HUB").separator("__"),
        );

        let built = builder
            .build()
            .map_err(|e| HubError::Config(format!("failed to build configuration: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| HubError::Config(format!("failed to deserialize configuration: {e}")))
    }

    pub async fn ensure_scaffold(&self) -> std::io::Result<()> {
        for dir in self.scaffold_dirs() {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}
