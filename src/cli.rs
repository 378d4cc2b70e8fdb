//! Command-line entry point: parses flags, loads layered configuration,
//! and runs the server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use crate::config::ServerConfig;
use crate::state::AppState;
use crate::{frontend, sweepers};

#[derive(Parser)]
#[command(name = "agent-hub")]
#[command(about = "Multi-agent collaboration hub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path (TOML). Missing file falls back to defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hub server.
    Serve {
        /// Port to listen on, overriding config/env.
        #[arg(short, long)]
        port: Option<u16>,

        /// Workspace data directory, overriding config/env.
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

pub struct CliRunner {
    config: ServerConfig,
}

impl CliRunner {
    pub async fn new(cli: &Cli) -> Result<Self> {
        let mut config = ServerConfig::load(cli.config.as_deref())
            .context("failed to load server configuration")?;

        if let Commands::Serve { port, workspace } = &cli.command {
            if let Some(port) = port {
                config.port = *port;
            }
            if let Some(workspace) = workspace {
                config.workspace_dir = workspace.clone();
            }
        }

        Ok(Self { config })
    }

    pub async fn run(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Serve { .. } => self.serve().await,
        }
    }

    async fn serve(&self) -> Result<()> {
        let state = AppState::init(self.config.clone())
            .await
            .context("failed to initialize server state")?;

        // Watch the workspace root itself (where DISCUSSION_BOARD.md and
        // TASK_BOARD.md live) in addition to the scaffold subdirectories,
        // so root-level writes are observable via the fs-watch path (§4.D).
        let mut watch_paths = vec![state.config.workspace_dir.clone()];
        watch_paths.extend(state.config.scaffold_dirs());
        let _watch_guard = state
            .fs_notifier
            .watch(watch_paths)
            .context("failed to start filesystem watcher")?;

        let sweeper_handles = sweepers::spawn_all(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
        let router = frontend::router(state.clone());
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        info!(%addr, "agent-hub listening");

        let shutdown = state.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = signal::ctrl_c().await;
                info!("shutdown signal received");
                shutdown.cancel();
            })
            .await
            .context("server error")?;

        state.shutdown.cancel();
        for handle in sweeper_handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cli_runner_applies_serve_overrides_over_config() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            config: None,
            verbose: false,
            command: Commands::Serve {
                port: Some(9999),
                workspace: Some(dir.path().to_path_buf()),
            },
        };

        let runner = CliRunner::new(&cli).await.unwrap();
        assert_eq!(runner.config.port, 9999);
        assert_eq!(runner.config.workspace_dir, dir.path());
    }
}
