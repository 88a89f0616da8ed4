//! Inbound channel for the Hub control loop.
//!
//! Every producer outside the control loop (socket connections, the
//! control-plane worker, the file watcher, signal handling) talks to the
//! Hub through a single `mpsc::UnboundedSender<HubInput>`. The control loop
//! drains the receiver each tick, which keeps it the only writer of Hub
//! state.

use tokio::sync::mpsc::UnboundedSender;

use super::actions::Action;
use super::events::EventEnvelope;
use crate::client::ClientId;

/// Message delivered to the Hub control loop.
#[derive(Debug)]
pub enum HubInput {
    /// An action from any client or background worker.
    Action(Action),

    /// A client wants events. It receives a snapshot first.
    ClientConnected {
        /// Client identity.
        id: ClientId,
        /// Where its envelopes go.
        sender: UnboundedSender<EventEnvelope>,
    },

    /// A client went away.
    ClientDisconnected {
        /// Client identity.
        id: ClientId,
    },

    /// Changed module names from the hot-reload watcher.
    ModulesChanged {
        /// Module names in dot notation.
        modules: Vec<String>,
    },

    /// Stop the control loop.
    Shutdown,
}
