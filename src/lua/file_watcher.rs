//! Hot-reload watcher for the module directory.
//!
//! Wraps a `notify` watcher on the modules directory, keeps only `.lua`
//! events and turns paths into dotted module names
//! (`agent/notes.lua` becomes `agent.notes`). Deletions are reported too so
//! the Hub can unload modules whose file went away.
//!
//! Two ways to consume changes:
//!
//! - [`ModuleWatcher::poll_changes`] drains buffered events without blocking.
//! - [`ModuleWatcher::forward_to`] moves the watcher onto a thread that
//!   pushes `HubInput::ModulesChanged` through a [`HubHandle`].

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::constants::WORKER_TICK;
use crate::hub::hub_handle::HubHandle;

type EventRx = mpsc::Receiver<Result<Event, notify::Error>>;

/// Watches a module directory for `.lua` changes.
pub struct ModuleWatcher {
    _watcher: RecommendedWatcher,
    rx: EventRx,
    base_path: PathBuf,
}

impl std::fmt::Debug for ModuleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleWatcher")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl ModuleWatcher {
    /// Starts watching `base_path` recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created or the
    /// directory cannot be watched.
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(&base_path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch: {}", base_path.display()))?;
        log::info!("Watching for module changes: {}", base_path.display());

        Ok(Self {
            _watcher: watcher,
            rx,
            base_path,
        })
    }

    /// Directory being watched.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Changed module names since the last call, deduplicated and sorted.
    #[must_use]
    pub fn poll_changes(&self) -> Vec<String> {
        let mut changed = BTreeSet::new();
        while let Ok(result) = self.rx.try_recv() {
            self.collect(result, &mut changed);
        }
        changed.into_iter().collect()
    }

    /// Moves the watcher onto a thread that reports changes to the Hub.
    ///
    /// The thread exits once the Hub's input channel closes.
    pub fn forward_to(self, hub: HubHandle) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("module-watcher".to_string())
            .spawn(move || {
                loop {
                    let first = match self.rx.recv_timeout(WORKER_TICK) {
                        Ok(result) => result,
                        Err(RecvTimeoutError::Timeout) => {
                            if hub.is_closed() {
                                break;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let mut changed = BTreeSet::new();
                    self.collect(first, &mut changed);
                    while let Ok(result) = self.rx.try_recv() {
                        self.collect(result, &mut changed);
                    }
                    if changed.is_empty() {
                        continue;
                    }
                    log::debug!("Module files changed: {changed:?}");
                    if hub.modules_changed(changed.into_iter().collect()).is_err() {
                        break;
                    }
                }
                log::debug!("Module watcher stopped");
            })
            .context("Failed to spawn module watcher thread")
    }

    fn collect(&self, result: Result<Event, notify::Error>, into: &mut BTreeSet<String>) {
        match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in &event.paths {
                    if let Some(name) = path_to_module(&self.base_path, path) {
                        into.insert(name);
                    }
                }
            }
            Err(e) => log::warn!("File watcher error: {e}"),
        }
    }
}

/// Converts a `.lua` path under `base` to a dotted module name.
///
/// Returns `None` for other extensions and paths outside `base`.
pub fn path_to_module(base: &Path, path: &Path) -> Option<String> {
    if path.extension() != Some(OsStr::new("lua")) {
        return None;
    }
    let relative = path.strip_prefix(base).ok()?;
    let name = relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".");
    (!name.is_empty()).then_some(name)
}
