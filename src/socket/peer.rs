//! Blocking socket peer used by the CLI subcommands.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use super::framing::{Frame, FrameDecoder};
use crate::hub::events::EventEnvelope;

/// One message received from the Hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// An event envelope.
    Event(EventEnvelope),
    /// A protocol-level error about one of our messages.
    Error(String),
}

/// Connection to a running Hub.
#[derive(Debug)]
pub struct PeerConnection {
    stream: UnixStream,
    decoder: FrameDecoder,
    pending: Vec<Frame>,
}

impl PeerConnection {
    /// Connects to the Hub socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no Hub is listening.
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("No hub listening on {}", path.display()))?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
        })
    }

    /// Sends `{"action": name, "payload": payload}`.
    pub fn send_action(&mut self, name: &str, payload: Value) -> Result<()> {
        let frame = Frame::Json(json!({ "action": name, "payload": payload }));
        self.stream.write_all(&frame.encode()?)?;
        Ok(())
    }

    /// Sends raw keystrokes.
    pub fn send_input(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(&Frame::Input(data.to_vec()).encode()?)?;
        Ok(())
    }

    /// Waits up to `timeout` for the next message. `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the Hub closed the connection or sent something
    /// unreadable.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Incoming>> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 64 * 1024];
        while self.pending.is_empty() {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => bail!("Hub closed the connection"),
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            };
            self.pending = self.decoder.feed(&buf[..n])?;
            self.pending.reverse();
            for reason in self.decoder.take_rejected() {
                log::warn!("[Socket] Skipped frame from hub: {reason}");
            }
        }
        match self.pending.pop() {
            Some(Frame::Json(value)) => parse_incoming(value).map(Some),
            Some(Frame::Input(_)) => bail!("Unexpected input frame from hub"),
            None => Ok(None),
        }
    }
}

fn parse_incoming(value: Value) -> Result<Incoming> {
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Ok(Incoming::Error(message.to_string()));
    }
    Ok(Incoming::Event(serde_json::from_value(value).context("Invalid event envelope")?))
}
