//! Event → op translation for client mirrors.
//!
//! Each [`HubEvent`] maps to a fixed list of [`MirrorOp`]s that fully
//! describes its effect on a mirror. The translation is pure; the mirror
//! decides nothing except how to apply each primitive op.

use crate::agent::{AgentInfo, AgentStatus, ScreenSnapshot};
use crate::git::WorktreeInfo;
use crate::hub::events::{HubEvent, PairingCode};

/// Primitive mirror mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOp {
    /// Drop the "being created" marker for a key.
    ClearPending {
        /// Agent key.
        agent_key: String,
    },
    /// Insert or replace an agent record.
    UpsertAgent(AgentInfo),
    /// Focus an agent on its primary session.
    FocusAgent {
        /// Agent key.
        agent_key: String,
    },
    /// Follow the Hub's focus. Unknown keys clear the selection.
    SetFocus {
        /// Focused key.
        agent_key: Option<String>,
        /// Session index.
        session: usize,
    },
    /// Remove an agent record and its marker, moving focus if needed.
    RemoveAgent {
        /// Agent key.
        agent_key: String,
    },
    /// Set the status of a known agent, or of its marker if not yet created.
    SetStatus {
        /// Agent key.
        agent_key: String,
        /// New status.
        status: AgentStatus,
    },
    /// Replace the agent list and focus.
    ReplaceAgents {
        /// New list.
        agents: Vec<AgentInfo>,
        /// Focused key.
        focused: Option<String>,
    },
    /// Replace the worktree list.
    ReplaceWorktrees(Vec<WorktreeInfo>),
    /// Replace the profile list.
    ReplaceProfiles(Vec<String>),
    /// Set or clear the pairing code; clears any pairing error.
    SetConnectionCode(Option<PairingCode>),
    /// Record a pairing error.
    SetConnectionError(String),
    /// Record the last error reported to this client.
    SetError(String),
    /// Store a requested screen.
    StoreScreen {
        /// Agent key.
        agent_key: String,
        /// Session index.
        session: usize,
        /// Screen.
        snapshot: ScreenSnapshot,
    },
}

/// Ops that apply `event` to a mirror, in order.
pub fn ops_for_event(event: &HubEvent) -> Vec<MirrorOp> {
    match event {
        HubEvent::AgentCreated { agent, focus } => {
            let mut ops = vec![
                MirrorOp::ClearPending {
                    agent_key: agent.key.clone(),
                },
                MirrorOp::UpsertAgent(agent.clone()),
            ];
            if *focus {
                ops.push(MirrorOp::FocusAgent {
                    agent_key: agent.key.clone(),
                });
            }
            ops
        }
        HubEvent::FocusChanged { agent_key, session } => vec![MirrorOp::SetFocus {
            agent_key: agent_key.clone(),
            session: *session,
        }],
        HubEvent::AgentDeleted { agent_key } => vec![MirrorOp::RemoveAgent {
            agent_key: agent_key.clone(),
        }],
        HubEvent::AgentStatusChanged { agent_key, status } => vec![MirrorOp::SetStatus {
            agent_key: agent_key.clone(),
            status: status.clone(),
        }],
        HubEvent::AgentList { agents, focused } => vec![MirrorOp::ReplaceAgents {
            agents: agents.clone(),
            focused: focused.clone(),
        }],
        HubEvent::WorktreeList { worktrees, .. } => {
            vec![MirrorOp::ReplaceWorktrees(worktrees.clone())]
        }
        HubEvent::Profiles { profiles } => vec![MirrorOp::ReplaceProfiles(profiles.clone())],
        HubEvent::ConnectionCode { pairing } => vec![MirrorOp::SetConnectionCode(pairing.clone())],
        HubEvent::ConnectionCodeError { error } => {
            vec![MirrorOp::SetConnectionError(error.clone())]
        }
        HubEvent::Error { message } => vec![MirrorOp::SetError(message.clone())],
        HubEvent::ScreenSnapshot {
            agent_key,
            session,
            snapshot,
        } => vec![MirrorOp::StoreScreen {
            agent_key: agent_key.clone(),
            session: *session,
            snapshot: snapshot.clone(),
        }],
    }
}
