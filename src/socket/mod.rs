//! Unix domain socket surface for out-of-process clients.
//!
//! Peers are ordinary clients: they submit the same actions as the
//! in-process client and receive the same event envelopes.
//!
//! # Architecture
//!
//! ```text
//! Hub process                              Peer (agent-hub action/status)
//! ┌────────────────────┐                  ┌──────────────────┐
//! │ SocketServer       │                  │ PeerConnection   │
//! │  UnixListener 0600 │◄────────────────►│  UnixStream      │
//! │  SocketClientConn  │  frames over     │                  │
//! │  per connection    │  Unix socket     │                  │
//! └────────┬───────────┘                  └──────────────────┘
//!          │ HubHandle (Action / ClientConnected / ClientDisconnected)
//!          ▼
//!       Hub control loop
//! ```
//!
//! # Wire Protocol
//!
//! Length-prefixed frames: `[u32 LE length][u8 type][payload]`.
//! See [`framing`].

pub mod client_conn;
pub mod framing;
pub mod peer;
pub mod server;

pub use peer::{Incoming, PeerConnection};
pub use server::SocketServer;
