//! PTY spawning and the per-session reading loop.
//!
//! Each session gets one dedicated reader thread. The thread blocks on the
//! PTY master, feeds every chunk to the session's vt100 parser under its
//! mutex, then broadcasts the raw bytes as [`PtyEvent::Output`]. It stops on
//! end-of-stream, on a read error, or when the session's cancel flag is set,
//! and always marks the session terminated on the way out.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtyPair, PtySize};
use tokio::sync::broadcast;

use super::notification::detect_notifications;
use super::pty::PtyEvent;
use crate::constants::SCROLLBACK_LINES;

/// Parameters for [`PtySession::spawn`](super::pty::PtySession::spawn).
#[derive(Debug, Clone)]
pub struct PtySpawnConfig {
    /// Display name used in logs.
    pub name: String,
    /// Working directory for the process.
    pub cwd: PathBuf,
    /// Command line, split on whitespace. Empty runs `$SHELL`.
    pub command: String,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Lines written to the PTY right after spawn.
    pub init_commands: Vec<String>,
    /// Initial height.
    pub rows: u16,
    /// Initial width.
    pub cols: u16,
    /// Scan output for OSC 9 / OSC 777 notifications.
    pub detect_notifications: bool,
}

impl PtySpawnConfig {
    /// Config for `command` in `cwd` with default size and no extra env.
    pub fn new(name: impl Into<String>, cwd: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cwd: cwd.into(),
            command: command.into(),
            env: BTreeMap::new(),
            init_commands: Vec::new(),
            rows: crate::constants::DEFAULT_ROWS,
            cols: crate::constants::DEFAULT_COLS,
            detect_notifications: true,
        }
    }
}

/// Open a new PTY pair with the given dimensions.
pub fn open_pty(rows: u16, cols: u16) -> Result<PtyPair> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    native_pty_system().openpty(size).context("Failed to open PTY")
}

/// Build a command from a command string.
///
/// An empty command string resolves to `$SHELL`, falling back to `/bin/sh`.
pub fn build_command(command: &str, cwd: &Path, env: &BTreeMap<String, String>) -> CommandBuilder {
    let mut parts = command.split_whitespace();
    let program = parts.next().map_or_else(
        || std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
        str::to_string,
    );

    let mut cmd = CommandBuilder::new(program);
    for arg in parts {
        cmd.arg(arg);
    }
    cmd.cwd(cwd);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd
}

/// Flags shared between a session and its reader thread.
#[derive(Debug, Clone, Default)]
pub struct ReaderFlags {
    /// Set by the session to ask the loop to stop after the current read.
    pub cancel: Arc<AtomicBool>,
    /// Set by the loop when it has exited.
    pub terminated: Arc<AtomicBool>,
}

/// Spawn the reading loop for one session.
pub fn spawn_reader_thread(
    label: String,
    reader: Box<dyn Read + Send>,
    parser: Arc<Mutex<vt100::Parser>>,
    event_tx: broadcast::Sender<PtyEvent>,
    flags: ReaderFlags,
    detect_notifs: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = reader;
        log::debug!("[{label}] reader thread started");
        let mut buf = [0u8; 4096];

        loop {
            if flags.cancel.load(Ordering::SeqCst) {
                log::debug!("[{label}] reader cancelled");
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];

                    if detect_notifs {
                        for notification in detect_notifications(chunk) {
                            log::info!("[{label}] notification: {}", notification.message());
                            let _ = event_tx.send(PtyEvent::notification(notification));
                        }
                    }

                    {
                        let mut parser = parser.lock().expect("parser lock poisoned");
                        parser.process(chunk);

                        // vt100 ignores CSI 3 J, so drop history by reseeding
                        // a fresh parser with the visible screen.
                        if contains_clear_scrollback(chunk) {
                            let (rows, cols) = parser.screen().size();
                            let visible = parser.screen().contents_formatted();
                            *parser = vt100::Parser::new(rows, cols, SCROLLBACK_LINES);
                            parser.process(&visible);
                        }
                    }

                    let _ = event_tx.send(PtyEvent::output(chunk.to_vec()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a closed slave side.
                    log::debug!("[{label}] read ended: {e}");
                    break;
                }
            }
        }

        flags.terminated.store(true, Ordering::SeqCst);
        let _ = event_tx.send(PtyEvent::process_exited(None));
        log::debug!("[{label}] reader thread exiting");
    })
}

fn contains_clear_scrollback(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"\x1b[3J")
}
