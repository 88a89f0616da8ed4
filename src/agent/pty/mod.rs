//! Terminal sessions: one PTY-backed process plus its parsed screen.
//!
//! # Architecture
//!
//! ```text
//! PtySession
//!  ├── state: Mutex<SharedPtyState>      master (resize), writer (input), child
//!  ├── parser: Arc<Mutex<vt100::Parser>> grid, attributes, scrollback ring
//!  ├── reader: JoinHandle                dedicated reading loop (see spawn.rs)
//!  └── event_tx: broadcast::Sender<PtyEvent>
//! ```
//!
//! Lock order is always `state` then `parser`. The reader thread only ever
//! takes `parser`, so a resize holding both is atomic with respect to output
//! processing: the PTY's window size and the parser's grid change together
//! or not at all.
//!
//! Snapshots take the parser lock only to copy the visible grid.

// Rust guideline compliant 2026-02

pub mod events;

pub use events::PtyEvent;

use std::io::Write;
use std::sync::{atomic::Ordering, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use portable_pty::{Child, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::screen::ScreenSnapshot;
use super::spawn::{self, PtySpawnConfig, ReaderFlags};
use crate::constants::{PROCESS_POLL_INTERVAL, PTY_EVENT_CAPACITY, READER_JOIN_TIMEOUT, SCROLLBACK_LINES};

/// Viewport movement over the scrollback ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    /// Scroll back by N lines.
    Up(usize),
    /// Scroll toward the live tail by N lines.
    Down(usize),
    /// Oldest retained line.
    ToTop,
    /// Live tail.
    ToBottom,
}

/// PTY handles guarded together so resize and input never interleave.
pub(crate) struct SharedPtyState {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

/// One pseudo-terminal-backed process.
pub struct PtySession {
    name: String,
    state: Mutex<SharedPtyState>,
    parser: Arc<Mutex<vt100::Parser>>,
    event_tx: broadcast::Sender<PtyEvent>,
    first_rx: Mutex<Option<broadcast::Receiver<PtyEvent>>>,
    flags: ReaderFlags,
    reader: Option<JoinHandle<()>>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("name", &self.name)
            .field("terminated", &self.is_terminated())
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Allocates a PTY, starts the child and the reading loop, then writes
    /// the configured init commands.
    pub fn spawn(config: PtySpawnConfig) -> Result<Self> {
        let pair = spawn::open_pty(config.rows, config.cols)?;
        let cmd = spawn::build_command(&config.command, &config.cwd, &config.env);
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn '{}' in {}", config.command, config.cwd.display()))?;
        // The child holds the only slave handle, so its exit closes the stream.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        let parser = Arc::new(Mutex::new(vt100::Parser::new(
            config.rows,
            config.cols,
            SCROLLBACK_LINES,
        )));
        let (event_tx, first_rx) = broadcast::channel(PTY_EVENT_CAPACITY);
        let flags = ReaderFlags::default();

        let handle = spawn::spawn_reader_thread(
            config.name.clone(),
            reader,
            Arc::clone(&parser),
            event_tx.clone(),
            flags.clone(),
            config.detect_notifications,
        );

        let session = Self {
            name: config.name,
            state: Mutex::new(SharedPtyState {
                master: Some(pair.master),
                writer: Some(writer),
                child: Some(child),
            }),
            parser,
            event_tx,
            first_rx: Mutex::new(Some(first_rx)),
            flags,
            reader: Some(handle),
            exit_code: None,
        };

        for line in &config.init_commands {
            session.write_input(format!("{line}\n").as_bytes())?;
        }

        log::info!("Spawned session '{}' in {}", session.name, config.cwd.display());
        Ok(session)
    }

    /// Session display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to session events.
    ///
    /// The first subscriber also receives everything broadcast since spawn.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyEvent> {
        self.first_rx
            .lock()
            .expect("first_rx lock poisoned")
            .take()
            .unwrap_or_else(|| self.event_tx.subscribe())
    }

    /// Resizes the PTY and the parser together.
    ///
    /// The parser is only touched after the PTY accepted the new size, and
    /// both happen while the parser lock is held.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        if rows == 0 || cols == 0 {
            bail!("Invalid terminal size {rows}x{cols}");
        }

        let state = self.state.lock().expect("pty state lock poisoned");
        let master = state.master.as_ref().context("Session is closed")?;
        let mut parser = self.parser.lock().expect("parser lock poisoned");

        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")?;
        parser.set_size(rows, cols);
        drop(parser);
        drop(state);

        let _ = self.event_tx.send(PtyEvent::resized(rows, cols));
        Ok(())
    }

    /// Size the PTY device reports as `(rows, cols)`.
    pub fn pty_size(&self) -> Result<(u16, u16)> {
        let state = self.state.lock().expect("pty state lock poisoned");
        let master = state.master.as_ref().context("Session is closed")?;
        let size = master.get_size().context("Failed to query PTY size")?;
        Ok((size.rows, size.cols))
    }

    /// Size the parser reports as `(rows, cols)`.
    pub fn screen_size(&self) -> (u16, u16) {
        self.parser.lock().expect("parser lock poisoned").screen().size()
    }

    /// Forwards raw bytes to the child's input.
    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("pty state lock poisoned");
        let writer = state.writer.as_mut().context("Session is closed")?;
        writer.write_all(data).context("Failed to write to PTY")?;
        writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    /// Moves the read-only viewport. Incoming output keeps landing on the
    /// live grid regardless of the offset.
    pub fn scroll(&self, direction: ScrollDirection) {
        let mut parser = self.parser.lock().expect("parser lock poisoned");
        let current = parser.screen().scrollback();
        let target = match direction {
            ScrollDirection::Up(n) => current.saturating_add(n),
            ScrollDirection::Down(n) => current.saturating_sub(n),
            ScrollDirection::ToTop => usize::MAX,
            ScrollDirection::ToBottom => 0,
        };
        parser.set_scrollback(target);
    }

    /// Current scroll offset from the live tail.
    pub fn scroll_offset(&self) -> usize {
        self.parser.lock().expect("parser lock poisoned").screen().scrollback()
    }

    /// Copies the visible screen.
    pub fn snapshot(&self) -> ScreenSnapshot {
        let parser = self.parser.lock().expect("parser lock poisoned");
        ScreenSnapshot::capture(parser.screen())
    }

    /// Whether the reading loop has stopped.
    pub fn is_terminated(&self) -> bool {
        self.flags.terminated.load(Ordering::SeqCst)
    }

    /// Handle on the termination flag, for observers outside the session.
    pub fn terminated_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.flags.terminated)
    }

    /// Exit code of the child, reaping it if it has exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            let mut state = self.state.lock().expect("pty state lock poisoned");
            if let Some(child) = state.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.exit_code = Some(status.exit_code() as i32);
                }
            }
        }
        self.exit_code
    }

    /// Cancels the reading loop, kills the child, releases the PTY and
    /// joins the reader thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.flags.cancel.store(true, Ordering::SeqCst);

        {
            let mut state = self.state.lock().expect("pty state lock poisoned");
            if let Some(mut child) = state.child.take() {
                kill_process_group(child.as_ref());
                let _ = child.kill();
                let deadline = Instant::now() + READER_JOIN_TIMEOUT;
                while Instant::now() < deadline {
                    if let Ok(Some(status)) = child.try_wait() {
                        self.exit_code.get_or_insert(status.exit_code() as i32);
                        break;
                    }
                    std::thread::sleep(PROCESS_POLL_INTERVAL);
                }
            }
            state.writer.take();
        }

        if let Some(handle) = self.reader.take() {
            let deadline = Instant::now() + READER_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(PROCESS_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::error!(
                    "[{}] reader thread still running after {}ms, detaching before teardown",
                    self.name,
                    READER_JOIN_TIMEOUT.as_millis()
                );
            }
        }

        self.state.lock().expect("pty state lock poisoned").master.take();
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.shutdown();
        }
    }
}

/// Kills the child's whole process group so grandchildren holding the PTY
/// slave do not keep the reading loop alive.
fn kill_process_group(child: &(dyn Child + Send + Sync)) {
    let Some(pid) = child.process_id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; an invalid or stale group id makes
    // it return an error, which is ignored.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}
