//! Typed events broadcast from the Hub to every client.
//!
//! Events are the only way Hub state reaches a client. Each one is wrapped
//! in an [`EventEnvelope`] carrying a per-client sequence number (assigned
//! when it is queued for that client) and the Hub state generation at the
//! time it was generated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentInfo, AgentStatus, ScreenSnapshot};
use crate::git::WorktreeInfo;

/// Pairing code shown to a user connecting a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    /// Where the peer goes to enter the code.
    pub url: String,
    /// One-time code.
    pub code: String,
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// An agent moved to a new lifecycle state.
    AgentStatusChanged {
        /// Agent key.
        agent_key: String,
        /// New status.
        status: AgentStatus,
    },
    /// An agent record was created or replaced.
    AgentCreated {
        /// Full record.
        agent: AgentInfo,
        /// Clients should focus it.
        #[serde(default)]
        focus: bool,
    },
    /// Hub focus moved to another agent or session.
    FocusChanged {
        /// Focused agent, if any.
        agent_key: Option<String>,
        /// Session shown for it.
        #[serde(default)]
        session: usize,
    },
    /// An agent was removed.
    AgentDeleted {
        /// Agent key.
        agent_key: String,
    },
    /// Full agent roster.
    AgentList {
        /// Agents in Hub order.
        agents: Vec<AgentInfo>,
        /// Hub-side focused agent.
        #[serde(default)]
        focused: Option<String>,
    },
    /// Full worktree list.
    WorktreeList {
        /// Repository the list was read from.
        #[serde(default)]
        repo_path: Option<PathBuf>,
        /// Secondary checkouts.
        worktrees: Vec<WorktreeInfo>,
    },
    /// Available profile names.
    Profiles {
        /// Names, sorted.
        profiles: Vec<String>,
    },
    /// Pairing code to display, or `None` to clear it.
    ConnectionCode {
        /// Code, if any.
        pairing: Option<PairingCode>,
    },
    /// Pairing code could not be produced.
    ConnectionCodeError {
        /// Reason.
        error: String,
    },
    /// A request from this client failed.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// Screen contents requested by this client.
    ScreenSnapshot {
        /// Agent key.
        agent_key: String,
        /// Session index.
        session: usize,
        /// Visible screen.
        snapshot: ScreenSnapshot,
    },
}

impl HubEvent {
    /// Wire name of the event, e.g. `agent_created`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStatusChanged { .. } => "agent_status_changed",
            Self::AgentCreated { .. } => "agent_created",
            Self::FocusChanged { .. } => "focus_changed",
            Self::AgentDeleted { .. } => "agent_deleted",
            Self::AgentList { .. } => "agent_list",
            Self::WorktreeList { .. } => "worktree_list",
            Self::Profiles { .. } => "profiles",
            Self::ConnectionCode { .. } => "connection_code",
            Self::ConnectionCodeError { .. } => "connection_code_error",
            Self::Error { .. } => "error",
            Self::ScreenSnapshot { .. } => "screen_snapshot",
        }
    }
}

/// An event as delivered to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Per-client sequence number, starting at 1 and contiguous.
    pub seq: u64,
    /// Hub state generation when the event was generated.
    pub generation: u64,
    /// Payload.
    pub event: HubEvent,
}
