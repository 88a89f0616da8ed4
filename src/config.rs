//! Configuration loading and persistence.
//!
//! The hub reads `config.json` from its config directory, falls back to
//! defaults when the file is missing, and then applies `AGENT_HUB_*`
//! environment overrides.

use std::collections::BTreeMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// One terminal session in a profile.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionDef {
    /// Display name of the session (e.g. "shell", "server").
    pub name: String,
    /// Command line to run. Empty means the user's `$SHELL`.
    #[serde(default)]
    pub command: String,
    /// Lines written to the session after spawn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_commands: Vec<String>,
}

/// A named set of sessions spawned together for each agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    /// Sessions in index order. Index 0 is the primary session.
    pub sessions: Vec<SessionDef>,
}

impl Profile {
    /// Single interactive shell.
    pub fn shell() -> Self {
        Self {
            sessions: vec![SessionDef {
                name: "shell".to_string(),
                command: String::new(),
                init_commands: Vec::new(),
            }],
        }
    }
}

/// Configuration for the hub daemon.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Control-plane base URL. Empty disables the control-plane worker.
    pub server_url: String,
    /// Control-plane API token.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Seconds between control-plane polls.
    pub poll_interval: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval: u64,
    /// Maximum number of live agents.
    pub max_sessions: usize,
    /// Base directory every managed worktree lives under.
    pub worktree_base: PathBuf,
    /// Directory scanned for `*.lua` extension modules.
    pub modules_dir: Option<PathBuf>,
    /// Directory agent-tier modules may read from. Defaults to the modules dir.
    pub agent_scope_dir: Option<PathBuf>,
    /// Soft budget for interceptors that do not set their own.
    pub interceptor_timeout_ms: u64,
    /// Budget for worktree init scripts.
    pub init_timeout_secs: u64,
    /// Budget for worktree teardown scripts.
    pub teardown_timeout_secs: u64,
    /// Session profiles keyed by name.
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        let worktree_base = dirs::home_dir()
            .map(|h| h.join("agent-hub-worktrees"))
            .unwrap_or_else(|| PathBuf::from("agent-hub-worktrees"));

        let mut profiles = BTreeMap::new();
        profiles.insert("default".to_string(), Profile::shell());

        Self {
            server_url: String::new(),
            token: String::new(),
            poll_interval: 5,
            heartbeat_interval: constants::HEARTBEAT_INTERVAL.as_secs(),
            max_sessions: 20,
            worktree_base,
            modules_dir: None,
            agent_scope_dir: None,
            interceptor_timeout_ms: constants::DEFAULT_INTERCEPTOR_TIMEOUT_MS,
            init_timeout_secs: constants::DEFAULT_INIT_TIMEOUT.as_secs(),
            teardown_timeout_secs: constants::DEFAULT_TEARDOWN_TIMEOUT.as_secs(),
            profiles,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `AGENT_HUB_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("AGENT_HUB_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("agent-hub")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory with env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        if config.profiles.is_empty() {
            config.profiles.insert("default".to_string(), Profile::shell());
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(server_url) = std::env::var("AGENT_HUB_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Ok(token) = std::env::var("AGENT_HUB_TOKEN") {
            self.token = token;
        }

        if let Ok(worktree_base) = std::env::var("AGENT_HUB_WORKTREE_BASE") {
            self.worktree_base = PathBuf::from(worktree_base);
        }

        if let Ok(poll_interval) = std::env::var("AGENT_HUB_POLL_INTERVAL") {
            if let Ok(interval) = poll_interval.parse::<u64>() {
                self.poll_interval = interval;
            }
        }

        if let Ok(modules_dir) = std::env::var("AGENT_HUB_MODULES_DIR") {
            self.modules_dir = Some(PathBuf::from(modules_dir));
        }
    }

    /// Persists the configuration with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether a control-plane is configured.
    pub fn has_control_plane(&self) -> bool {
        !self.server_url.is_empty() && !self.token.is_empty()
    }

    /// Path of the hub's Unix socket.
    pub fn socket_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("hub.sock"))
    }

    /// Looks up a profile, falling back to `default`.
    pub fn profile(&self, name: Option<&str>) -> Option<&Profile> {
        match name {
            Some(name) => self.profiles.get(name),
            None => self
                .profiles
                .get("default")
                .or_else(|| self.profiles.values().next()),
        }
    }

    /// Profile names in sorted order.
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Directory agent-tier modules are scoped to.
    pub fn agent_scope(&self) -> Option<PathBuf> {
        self.agent_scope_dir
            .clone()
            .or_else(|| self.modules_dir.clone())
    }

    pub(crate) fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub(crate) fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_shell_profile() {
        let config = Config::default();
        let profile = config.profile(None).expect("default profile");
        assert_eq!(profile.sessions.len(), 1);
        assert_eq!(profile.sessions[0].name, "shell");
        assert!(config.profile(Some("missing")).is_none());
    }

    #[test]
    fn test_load_from_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"server_url": "https://hub.example", "poll_interval": 9}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server_url, "https://hub.example");
        assert_eq!(config.poll_interval, 9);
        assert_eq!(config.max_sessions, 20);
        assert_eq!(config.profile_names(), vec!["default".to_string()]);
    }

    #[test]
    fn test_load_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"profiles": {"dev": {"sessions": [
                {"name": "agent", "command": "claude"},
                {"name": "server", "command": "bin/dev", "init_commands": ["export PORT=3000"]}
            ]}}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        let dev = config.profile(Some("dev")).unwrap();
        assert_eq!(dev.sessions.len(), 2);
        assert_eq!(dev.sessions[1].init_commands, vec!["export PORT=3000"]);
        assert_eq!(config.profile(None), Some(dev));
    }

    #[test]
    fn test_has_control_plane_requires_url_and_token() {
        let mut config = Config::default();
        assert!(!config.has_control_plane());
        config.server_url = "https://hub.example".to_string();
        assert!(!config.has_control_plane());
        config.token = "tok".to_string();
        assert!(config.has_control_plane());
    }
}
