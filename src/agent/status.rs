//! Agent lifecycle states.
//!
//! ```text
//! creating_worktree -> spawning_sessions -> running -> stopping -> removing_worktree -> deleted
//!                                                   \------------------------------->/
//!         any non-terminal state -> failed
//! ```
//!
//! The Hub drives every transition; an agent never changes its own status.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum AgentStatus {
    /// Worktree is being created or reused.
    CreatingWorktree,
    /// Terminal sessions are being started.
    SpawningSessions,
    /// All sessions started.
    Running,
    /// Close requested; sessions are being cancelled and joined.
    Stopping,
    /// Sessions are gone; the worktree is being torn down.
    RemovingWorktree,
    /// Fully torn down.
    Deleted,
    /// A lifecycle step failed.
    Failed(String),
}

impl AgentStatus {
    /// No transitions leave a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted | Self::Failed(_))
    }

    /// Whether a close has already started (or finished).
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Stopping | Self::RemovingWorktree | Self::Deleted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use AgentStatus::{
            CreatingWorktree, Deleted, Failed, RemovingWorktree, Running, SpawningSessions, Stopping,
        };
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed(_))
                | (CreatingWorktree, SpawningSessions)
                | (SpawningSessions, Running)
                | (Running, Stopping | RemovingWorktree)
                | (Stopping, RemovingWorktree | Deleted)
                | (RemovingWorktree, Deleted)
        )
    }

    /// Short machine name, e.g. `creating_worktree`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatingWorktree => "creating_worktree",
            Self::SpawningSessions => "spawning_sessions",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::RemovingWorktree => "removing_worktree",
            Self::Deleted => "deleted",
            Self::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}
