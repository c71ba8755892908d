use std::os::unix::fs::MetadataExt as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use keyward_core::config::{Config, default_config_path};
use keyward_ssh_agent::AgentService;
use tracing_subscriber::EnvFilter;

/// SSH agent whose private keys live in a custody daemon.
#[derive(Debug, Parser)]
#[command(name = "keywardd", version)]
struct Cli {
    /// Path to config file (default: $XDG_CONFIG_HOME/keyward/config.toml)
    #[arg(short, long, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Agent socket path (overrides `agent.socket_path`)
    #[arg(long, env = "KEYWARD_AGENT_SOCKET")]
    socket: Option<PathBuf>,

    /// Key storage file (overrides `agent.storage_path`)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Custody daemon socket (overrides `agent.vault_socket_path`)
    #[arg(long, env = "KEYWARD_VAULT_SOCKET")]
    vault_socket: Option<PathBuf>,

    /// Seconds to wait for a custody daemon reply (overrides `agent.request_timeout_secs`)
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Import the named custody daemon secret, print its public key and exit
    #[arg(long, value_name = "SECRET", conflicts_with = "public_key")]
    import: Option<String>,

    /// Print the stored public key of the named secret and exit
    #[arg(long, value_name = "SECRET")]
    public_key: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(path) = &self.socket {
            config.agent.socket_path = path.clone();
        }
        if let Some(path) = &self.storage {
            config.agent.storage_path = path.clone();
        }
        if let Some(path) = &self.vault_socket {
            config.agent.vault_socket_path = path.clone();
        }
        if let Some(secs) = self.request_timeout {
            config.agent.request_timeout_secs = Some(secs);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    cli.apply_overrides(&mut config);

    let service = AgentService::connect(&config.agent)
        .await
        .with_context(|| {
            format!(
                "connect to custody daemon at {}",
                config.agent.vault_socket_path.display()
            )
        })?;

    if let Some(name) = &cli.import {
        let public_key = service.import_identity(name).await?;
        println!("{public_key}");
        return Ok(());
    }
    if let Some(name) = &cli.public_key {
        println!("{}", service.export_public_key(name)?);
        return Ok(());
    }

    service.start().await?;

    let outcome = tokio::select! {
        res = service.run() => res,
        _ = shutdown_signal() => {
            tracing::info!("received shutdown signal, exiting");
            Ok(())
        }
    };
    service.shutdown();
    outcome
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode & 0o777),
                    "config file is readable by group or others, recommend: chmod 600 {}",
                    path.display()
                );
            }
        }
        Err(e) => {
            tracing::warn!("could not check config file permissions: {e}");
        }
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("parse config {}", path.display()))?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}
