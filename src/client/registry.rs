//! Hub-side registry of connected clients.
//!
//! Every client gets its own sequence counter. An event broadcast to three
//! clients is wrapped three times, each with that client's next number, so
//! every client sees a contiguous `1, 2, 3, ...` regardless of when it
//! joined.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use super::ClientId;
use crate::hub::events::{EventEnvelope, HubEvent};

struct Connection {
    sender: UnboundedSender<EventEnvelope>,
    next_seq: u64,
}

impl Connection {
    fn send(&mut self, generation: u64, event: HubEvent) -> bool {
        let envelope = EventEnvelope {
            seq: self.next_seq,
            generation,
            event,
        };
        if self.sender.send(envelope).is_err() {
            return false;
        }
        self.next_seq += 1;
        true
    }
}

/// Connected clients keyed by identity.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Connection>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. A reconnect under the same id restarts at seq 1.
    pub fn register(&mut self, id: ClientId, sender: UnboundedSender<EventEnvelope>) {
        log::info!("Client connected: {id}");
        self.clients.insert(id, Connection { sender, next_seq: 1 });
    }

    /// Unregister a client. Returns whether it was known.
    pub fn unregister(&mut self, id: &ClientId) -> bool {
        let known = self.clients.remove(id).is_some();
        if known {
            log::info!("Client disconnected: {id}");
        }
        known
    }

    /// Whether `id` is connected.
    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Sends to one client. A closed client is dropped and `false` returned.
    pub fn send_to(&mut self, id: &ClientId, generation: u64, event: HubEvent) -> bool {
        let Some(conn) = self.clients.get_mut(id) else {
            return false;
        };
        if conn.send(generation, event) {
            return true;
        }
        log::debug!("Dropping closed client {id}");
        self.clients.remove(id);
        false
    }

    /// Sends to every client, dropping the ones whose receivers are gone.
    /// Returns how many received the event.
    pub fn broadcast(&mut self, generation: u64, event: &HubEvent) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        for (id, conn) in &mut self.clients {
            if conn.send(generation, event.clone()) {
                delivered += 1;
            } else {
                closed.push(id.clone());
            }
        }
        for id in closed {
            log::debug!("Dropping closed client {id}");
            self.clients.remove(&id);
        }
        delivered
    }

    /// Connected client ids.
    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().cloned().collect()
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// No clients connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn error(msg: &str) -> HubEvent {
        HubEvent::Error {
            message: msg.to_string(),
        }
    }

    #[test]
    fn test_seq_is_per_client_and_contiguous() {
        let mut registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        registry.register(ClientId::Local, tx_a);
        registry.broadcast(0, &error("one"));

        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register(ClientId::Peer(1), tx_b);
        registry.broadcast(0, &error("two"));
        registry.send_to(&ClientId::Peer(1), 0, error("three"));

        let a: Vec<u64> = std::iter::from_fn(|| rx_a.try_recv().ok()).map(|e| e.seq).collect();
        let b: Vec<u64> = std::iter::from_fn(|| rx_b.try_recv().ok()).map(|e| e.seq).collect();
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![1, 2]);
    }

    #[test]
    fn test_closed_clients_are_dropped() {
        let mut registry = ClientRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(ClientId::Peer(2), tx);
        drop(rx);

        assert_eq!(registry.broadcast(3, &error("x")), 0);
        assert!(registry.is_empty());
        assert!(!registry.send_to(&ClientId::Peer(2), 3, error("y")));
    }

    #[test]
    fn test_unregister_reports_known_clients_once() {
        let mut registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(ClientId::Peer(4), tx);

        assert!(registry.contains(&ClientId::Peer(4)));
        assert!(registry.unregister(&ClientId::Peer(4)));
        assert!(!registry.unregister(&ClientId::Peer(4)));
    }

    #[test]
    fn test_envelope_carries_generation() {
        let mut registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(ClientId::Local, tx);
        registry.broadcast(7, &error("x"));
        assert_eq!(rx.try_recv().unwrap().generation, 7);
    }
}
