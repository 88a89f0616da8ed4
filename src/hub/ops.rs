//! Ops returned by action handlers.
//!
//! A handler never mutates the Hub. It returns a list of [`HubOp`]s and the
//! dispatcher applies them strictly in the order returned. Ops are plain
//! data, so handlers written in Lua produce them as tables:
//!
//! ```lua
//! return {
//!   { op = "set_mode", mode = "normal" },
//!   { op = "spawn_agent", branch = "feature-1", profile = "claude" },
//! }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::UiMode;
use crate::agent::ScrollDirection;

fn default_true() -> bool {
    true
}

/// Request to create an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Branch for the worktree.
    pub branch: String,
    /// Primary checkout; the Hub's repository when absent.
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    /// Ref to branch from when the branch does not exist yet.
    #[serde(default)]
    pub base_ref: Option<String>,
    /// Profile name; the default profile when absent.
    #[serde(default)]
    pub profile: Option<String>,
    /// Issue or task number.
    #[serde(default)]
    pub issue_number: Option<u64>,
    /// Display name; the branch when absent.
    #[serde(default)]
    pub name: Option<String>,
    /// Focus the agent once created.
    #[serde(default = "default_true")]
    pub focus: bool,
    /// Initial metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl SpawnRequest {
    /// Request for `branch` with defaults.
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            repo_path: None,
            base_ref: None,
            profile: None,
            issue_number: None,
            name: None,
            focus: true,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the repository.
    #[must_use]
    pub fn in_repo(mut self, repo_path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(repo_path.into());
        self
    }

    /// Sets the profile.
    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

/// Primitive, order-significant Hub mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HubOp {
    /// Switch input mode.
    SetMode {
        /// New mode.
        mode: UiMode,
    },
    /// Create an agent.
    SpawnAgent(SpawnRequest),
    /// Close an agent (the focused one when `agent_key` is absent).
    CloseAgent {
        /// Target.
        #[serde(default)]
        agent_key: Option<String>,
        /// Also remove its worktree.
        #[serde(default)]
        delete_worktree: bool,
    },
    /// Focus an agent.
    Focus {
        /// Target.
        agent_key: String,
    },
    /// Focus the next agent.
    FocusNext,
    /// Focus the previous agent.
    FocusPrevious,
    /// Focus a session of the focused agent.
    FocusSession {
        /// Session index.
        session: usize,
    },
    /// Write text to a session (focused agent and session by default).
    WriteInput {
        /// Target agent.
        #[serde(default)]
        agent_key: Option<String>,
        /// Target session.
        #[serde(default)]
        session: Option<usize>,
        /// Text to write.
        data: String,
    },
    /// Resize every session and remember the size for new ones.
    Resize {
        /// Rows.
        rows: u16,
        /// Columns.
        cols: u16,
    },
    /// Scroll the focused session.
    Scroll {
        /// Direction.
        direction: ScrollDirection,
    },
    /// Set a metadata entry on an agent.
    SetMetadata {
        /// Target (focused agent when absent).
        #[serde(default)]
        agent_key: Option<String>,
        /// Key.
        key: String,
        /// Value; `null` removes the entry.
        value: Value,
    },
    /// Send a notification to the control-plane.
    Notify {
        /// Agent the notification is about.
        #[serde(default)]
        agent_key: Option<String>,
        /// Text.
        message: String,
    },
    /// Show an error to the requesting client.
    ShowError {
        /// Text.
        message: String,
    },
    /// Re-read and broadcast the worktree list.
    RefreshWorktrees,
    /// Generate and broadcast a pairing code.
    ShowConnectionCode,
    /// Clear the pairing code.
    ClearConnectionCode,
    /// Send a screen snapshot to the requesting client.
    SendScreen {
        /// Target agent (focused when absent).
        #[serde(default)]
        agent_key: Option<String>,
        /// Session (focused session when absent).
        #[serde(default)]
        session: Option<usize>,
    },
    /// Send the full snapshot (agents, worktrees, profiles) to the requesting client.
    SendSnapshot,
    /// Stop the Hub.
    Quit,
}
