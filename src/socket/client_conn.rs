//! Per-connection tasks for socket peers (Hub-side).
//!
//! Each accepted connection registers with the Hub as
//! [`ClientId::Peer`] and gets two tasks:
//!
//! - read: decodes frames, turns JSON into [`Action`]s and raw input into
//!   input actions, submits them through the [`HubHandle`]
//! - write: encodes the peer's [`EventEnvelope`]s as JSON frames
//!
//! Malformed messages, including JSON that does not parse, are answered
//! with `{"error": "..."}` on the same connection and do not close it. A
//! framing error does.

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::framing::{Frame, FrameDecoder};
use crate::client::ClientId;
use crate::hub::actions::Action;
use crate::hub::events::EventEnvelope;
use crate::hub::hub_handle::HubHandle;

/// Hub-side state for one socket peer.
pub struct SocketClientConn {
    id: ClientId,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for SocketClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClientConn")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SocketClientConn {
    /// Registers `id` with the Hub and starts the read and write tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the Hub is no longer running.
    pub(crate) fn spawn(id: ClientId, stream: UnixStream, hub: HubHandle) -> anyhow::Result<Self> {
        let events = hub.connect(id.clone())?;
        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let read_handle = tokio::spawn(Self::read_loop(id.clone(), read_half, hub, reply_tx));
        let write_handle = tokio::spawn(Self::write_loop(id.clone(), write_half, events, reply_rx));

        Ok(Self {
            id,
            read_handle,
            write_handle,
        })
    }

    /// Peer identity.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Whether both tasks have finished.
    pub fn is_finished(&self) -> bool {
        self.read_handle.is_finished() && self.write_handle.is_finished()
    }

    /// Aborts both tasks.
    pub fn disconnect(self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }

    async fn read_loop(
        id: ClientId,
        mut reader: OwnedReadHalf,
        hub: HubHandle,
        reply_tx: UnboundedSender<Value>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64 * 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("[Socket] {id} disconnected");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log::warn!("[Socket] Read error for {id}: {e}");
                    break;
                }
            };
            let frames = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => {
                    log::warn!("[Socket] Frame decode error for {id}: {e}");
                    break;
                }
            };
            for reason in decoder.take_rejected() {
                let _ = reply_tx.send(json!({ "error": reason }));
            }
            for frame in frames {
                let action = match frame {
                    Frame::Json(msg) => match Action::from_wire(&msg, id.clone()) {
                        Ok(action) => action,
                        Err(e) => {
                            let _ = reply_tx.send(json!({ "error": format!("{e:#}") }));
                            continue;
                        }
                    },
                    Frame::Input(data) => Action::input(id.clone(), data),
                };
                if hub.submit(action).is_err() {
                    log::debug!("[Socket] Hub gone, closing {id}");
                    return;
                }
            }
        }
        let _ = hub.disconnect(id);
    }

    async fn write_loop(
        id: ClientId,
        mut writer: OwnedWriteHalf,
        mut events: UnboundedReceiver<EventEnvelope>,
        mut replies: UnboundedReceiver<Value>,
    ) {
        loop {
            let value = tokio::select! {
                envelope = events.recv() => match envelope {
                    Some(envelope) => match serde_json::to_value(&envelope) {
                        Ok(value) => value,
                        Err(e) => {
                            log::error!("[Socket] Cannot encode envelope for {id}: {e}");
                            continue;
                        }
                    },
                    None => break,
                },
                reply = replies.recv() => match reply {
                    Some(value) => value,
                    None => break,
                },
            };
            let bytes = match Frame::Json(value).encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("[Socket] Cannot frame message for {id}: {e}");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                log::warn!("[Socket] Write error for {id}: {e}");
                break;
            }
        }
    }
}
