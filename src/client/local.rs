//! In-process client.
//!
//! Holds a [`ClientMirror`] fed from the Hub's event stream and submits
//! actions through a [`HubHandle`], exactly like a socket peer does. When
//! the mirror detects a gap it asks the Hub for a fresh `agent_list`.

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use super::mirror::{ClientMirror, MirrorError};
use super::ClientId;
use crate::hub::actions::Action;
use crate::hub::events::EventEnvelope;
use crate::hub::hub_handle::HubHandle;

/// Client living in the Hub's own process.
#[derive(Debug)]
pub struct LocalClient {
    id: ClientId,
    hub: HubHandle,
    events: UnboundedReceiver<EventEnvelope>,
    mirror: ClientMirror,
    resync_requested: bool,
}

impl LocalClient {
    /// Connect to the Hub as [`ClientId::Local`].
    pub fn connect(hub: HubHandle) -> Result<Self> {
        Self::connect_as(hub, ClientId::Local)
    }

    /// Connect under an explicit identity.
    pub fn connect_as(hub: HubHandle, id: ClientId) -> Result<Self> {
        let events = hub.connect(id.clone())?;
        Ok(Self {
            id,
            hub,
            events,
            mirror: ClientMirror::new(),
            resync_requested: false,
        })
    }

    /// Identity.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Mirrored state.
    pub fn mirror(&self) -> &ClientMirror {
        &self.mirror
    }

    /// Submits an action as this client.
    pub fn submit(&self, name: &str, payload: Value) -> Result<()> {
        self.hub
            .submit(Action::new(name, payload).from_client(self.id.clone()))
    }

    /// Sends raw keystrokes as this client.
    pub fn send_keys(&self, data: &[u8]) -> Result<()> {
        self.hub.submit(Action::input(self.id.clone(), data.to_vec()))
    }

    /// Applies every queued envelope. Returns the envelopes applied.
    ///
    /// A refused envelope triggers one `resync` request; further refusals
    /// are ignored until the snapshot lands.
    pub fn pump(&mut self) -> Vec<EventEnvelope> {
        let mut applied = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            match self.mirror.apply_envelope(&envelope) {
                Ok(()) => {
                    self.resync_requested = false;
                    applied.push(envelope);
                }
                Err(e) => self.on_refused(&e),
            }
        }
        applied
    }

    /// Waits for the next envelope and applies it. `None` once the Hub is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            let envelope = self.events.recv().await?;
            match self.mirror.apply_envelope(&envelope) {
                Ok(()) => {
                    self.resync_requested = false;
                    return Some(envelope);
                }
                Err(e) => self.on_refused(&e),
            }
        }
    }

    fn on_refused(&mut self, err: &MirrorError) {
        log::debug!("[{}] mirror refused event: {err}", self.id);
        if self.resync_requested {
            return;
        }
        self.resync_requested = true;
        if let Err(e) = self.submit("resync", Value::Null) {
            log::warn!("[{}] resync request failed: {e}", self.id);
        }
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        let _ = self.hub.disconnect(self.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::events::HubEvent;
    use crate::hub::input::HubInput;
    use tokio::sync::mpsc;

    #[test]
    fn test_gap_requests_one_resync() {
        let (tx, mut inbox) = mpsc::unbounded_channel();
        let mut client = LocalClient::connect(HubHandle::new(tx)).unwrap();
        let sender = match inbox.try_recv().unwrap() {
            HubInput::ClientConnected { sender, .. } => sender,
            other => panic!("unexpected {other:?}"),
        };

        for seq in [2, 3] {
            sender
                .send(EventEnvelope {
                    seq,
                    generation: 0,
                    event: HubEvent::Error { message: "x".into() },
                })
                .unwrap();
        }
        assert!(client.pump().is_empty());
        assert!(client.mirror().needs_resync());

        let mut resyncs = 0;
        while let Ok(input) = inbox.try_recv() {
            if let HubInput::Action(action) = input {
                assert_eq!(action.name, "resync");
                assert_eq!(action.source, ClientId::Local);
                resyncs += 1;
            }
        }
        assert_eq!(resyncs, 1);

        sender
            .send(EventEnvelope {
                seq: 10,
                generation: 0,
                event: HubEvent::AgentList { agents: vec![], focused: None },
            })
            .unwrap();
        assert_eq!(client.pump().len(), 1);
        assert!(!client.mirror().needs_resync());
    }
}
