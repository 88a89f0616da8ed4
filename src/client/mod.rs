//! Clients: observers that mirror Hub state from its event stream.
//!
//! This module provides:
//! - `ClientId` - identity of whoever sent an action or receives events
//! - `ClientRegistry` - Hub-side fan-out with per-client sequence numbers
//! - `ClientMirror` - client-side state rebuilt only by replaying events
//! - `LocalClient` - an in-process client that pumps a mirror
//!
//! # Architecture
//!
//! ```text
//! Hub control loop
//!   │ HubEvent ──► ClientRegistry ──► EventEnvelope{seq, generation}
//!   │                                   │
//!   │                     ┌─────────────┴─────────────┐
//!   │                     ▼                           ▼
//!   │              LocalClient                 socket peer
//!   │              ClientMirror                (same envelopes as JSON)
//!   ◄── Action ───────────┘                           │
//!   ◄── Action ───────────────────────────────────────┘
//! ```
//!
//! Local and remote clients get identical envelopes and submit identical
//! actions.

// Rust guideline compliant 2026-02

mod local;
mod mirror;
mod ops;
mod registry;

pub use local::LocalClient;
pub use mirror::{ClientMirror, MirrorError, MirrorState, OpBatch};
pub use ops::{ops_for_event, MirrorOp};
pub use registry::ClientRegistry;

/// Identity of a client or internal action source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    /// The in-process client.
    Local,
    /// A socket peer, numbered by connection order.
    Peer(u64),
    /// The control-plane worker.
    ControlPlane,
    /// Hub internals and extension modules.
    Internal,
}

impl ClientId {
    /// Whether events can be delivered to this identity.
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Local | Self::Peer(_))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Peer(n) => write!(f, "peer:{n}"),
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
