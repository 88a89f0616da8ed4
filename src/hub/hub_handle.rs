//! Hub handle for thread-safe communication with the control loop.
//!
//! `HubHandle` wraps the Hub's inbound channel. It is the only way code
//! outside the control loop (socket connections, the control-plane worker,
//! the module watcher, an in-process client) reaches the Hub.
//!
//! # Thread Safety
//!
//! `HubHandle` is `Clone + Send + Sync`:
//! - Clone it freely to share across threads and async tasks
//! - Every method is non-blocking (the channel is unbounded)
//! - A closed channel is reported as an error, never a panic
//!
//! # Example
//!
//! ```ignore
//! let handle = hub.handle();
//! std::thread::spawn(move || {
//!     let events = handle.connect(ClientId::Peer(1))?;
//!     handle.submit(Action::new("resync", Value::Null).from_client(ClientId::Peer(1)))?;
//!     // ...
//! });
//! ```

// Rust guideline compliant 2026-02

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::actions::Action;
use super::events::EventEnvelope;
use super::input::HubInput;
use crate::client::ClientId;

/// Handle for submitting input to the Hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    input_tx: UnboundedSender<HubInput>,
}

impl HubHandle {
    /// Create a handle from the Hub's input sender.
    #[must_use]
    pub fn new(input_tx: UnboundedSender<HubInput>) -> Self {
        Self { input_tx }
    }

    /// Create a handle whose Hub is already gone.
    ///
    /// Every operation fails with a closed-channel error.
    #[must_use]
    pub fn mock() -> Self {
        let (input_tx, _rx) = mpsc::unbounded_channel();
        Self { input_tx }
    }

    fn send(&self, input: HubInput) -> Result<()> {
        self.input_tx
            .send(input)
            .map_err(|_| anyhow!("Hub is not running"))
    }

    /// Queue an action for the control loop.
    pub fn submit(&self, action: Action) -> Result<()> {
        self.send(HubInput::Action(action))
    }

    /// Register a client and return its event stream.
    ///
    /// The first event on the stream is an `agent_list` snapshot.
    pub fn connect(&self, id: ClientId) -> Result<UnboundedReceiver<EventEnvelope>> {
        let (sender, rx) = mpsc::unbounded_channel();
        self.send(HubInput::ClientConnected { id, sender })?;
        Ok(rx)
    }

    /// Unregister a client.
    pub fn disconnect(&self, id: ClientId) -> Result<()> {
        self.send(HubInput::ClientDisconnected { id })
    }

    /// Ask the Hub to reload modules by name.
    pub fn modules_changed(&self, modules: Vec<String>) -> Result<()> {
        self.send(HubInput::ModulesChanged { modules })
    }

    /// Ask the control loop to stop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(HubInput::Shutdown)
    }

    /// Whether the Hub has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.input_tx.is_closed()
    }
}
