//! Submit one action to a running Hub over its socket.
//!
//! Connects as a peer, sends the action, then prints every event received
//! until the Hub has been quiet for `idle`. The snapshot events a new peer
//! receives first are skipped unless `--all` is given.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::hub::events::HubEvent;
use crate::socket::{Incoming, PeerConnection};

/// Events sent to every new peer before anything else.
const SNAPSHOT_EVENTS: &[&str] = &["agent_list", "worktree_list", "profiles", "connection_code"];

/// Parses a `--payload` argument; absent means `null`.
pub fn parse_payload(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(text) => serde_json::from_str(text).context("--payload is not valid JSON"),
        None => Ok(Value::Null),
    }
}

/// Sends `name` with `payload` and prints the resulting events as JSON lines.
///
/// Returns the number of events printed.
///
/// # Errors
///
/// Returns an error if no Hub is listening or the connection breaks.
pub fn run(socket: &Path, name: &str, payload: Value, idle: Duration, all: bool) -> Result<usize> {
    let mut peer = PeerConnection::connect(socket)?;
    peer.send_action(name, payload)?;

    let mut printed = 0;
    let mut last = Instant::now();
    while last.elapsed() < idle {
        let Some(incoming) = peer.recv(idle.saturating_sub(last.elapsed()))? else {
            break;
        };
        last = Instant::now();
        match incoming {
            Incoming::Error(message) => eprintln!("error: {message}"),
            Incoming::Event(envelope) => {
                if !all && is_snapshot(&envelope.event) && envelope.seq <= SNAPSHOT_EVENTS.len() as u64 {
                    continue;
                }
                println!("{}", serde_json::to_string(&envelope)?);
                printed += 1;
            }
        }
    }
    Ok(printed)
}

fn is_snapshot(event: &HubEvent) -> bool {
    SNAPSHOT_EVENTS.contains(&event.name())
}
