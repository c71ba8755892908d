use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unix socket the SSH agent listens on (`SSH_AUTH_SOCK` for clients).
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// JSON file holding the public data of imported keys.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Unix socket of the custody daemon that holds the private keys.
    #[serde(default = "default_vault_socket_path")]
    pub vault_socket_path: PathBuf,

    /// Delay before retrying after a failed `accept` on the agent socket.
    #[serde(default = "default_accept_backoff_ms")]
    pub accept_backoff_ms: u64,

    /// Upper bound on a single custody daemon round-trip.  Unset means wait
    /// indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            storage_path: default_storage_path(),
            vault_socket_path: default_vault_socket_path(),
            accept_backoff_ms: default_accept_backoff_ms(),
            request_timeout_secs: None,
        }
    }
}

/// `$XDG_CONFIG_HOME/keyward/config.toml` (default: `~/.config/keyward/config.toml`).
pub fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
        .join("keyward")
        .join("config.toml")
}

/// `$XDG_RUNTIME_DIR/keyward/agent.sock`, or `/tmp/keyward-agent.sock` when
/// there is no runtime directory.
fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("keyward").join("agent.sock"),
        None => PathBuf::from("/tmp/keyward-agent.sock"),
    }
}

fn default_storage_path() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
        .join("keyward")
        .join("agent_storage.json")
}

fn default_vault_socket_path() -> PathBuf {
    PathBuf::from("/tmp/custody_daemon.sock")
}

fn default_accept_backoff_ms() -> u64 {
    1000
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(home_fallback)))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.agent.accept_backoff_ms, 1000);
        assert!(cfg.agent.request_timeout_secs.is_none());
        assert!(cfg.agent.storage_path.ends_with("keyward/agent_storage.json"));
        assert_eq!(
            cfg.agent.vault_socket_path,
            PathBuf::from("/tmp/custody_daemon.sock")
        );
    }

    #[test]
    fn agent_section_overrides_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [agent]
            socket_path = "/run/user/1000/agent.sock"
            vault_socket_path = "/run/custody.sock"
            accept_backoff_ms = 250
            request_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.agent.socket_path, PathBuf::from("/run/user/1000/agent.sock"));
        assert_eq!(cfg.agent.vault_socket_path, PathBuf::from("/run/custody.sock"));
        assert_eq!(cfg.agent.accept_backoff_ms, 250);
        assert_eq!(cfg.agent.request_timeout_secs, Some(30));
        // Unspecified fields keep their defaults.
        assert!(cfg.agent.storage_path.ends_with("agent_storage.json"));
    }

    #[test]
    fn config_path_is_under_keyward() {
        assert!(default_config_path().ends_with("keyward/config.toml"));
    }
}
