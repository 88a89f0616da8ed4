//! Hub - central owner of agent state.
//!
//! The Hub owns the agent set, the worktree manager, the extension
//! registries and every client's event queue. A single control loop
//! mutates that state; everything else talks to it through a
//! [`HubHandle`].
//!
//! # Architecture
//!
//! ```text
//!   socket peers   control-plane worker   module watcher   Lua hub.submit
//!        │                  │                   │                │
//!        └──────────────────┴───── HubInput ────┴────────────────┘
//!                                     │
//!                                     ▼
//!            ┌──────────────────────────────────────────┐
//!            │ Hub (single thread, !Send)               │
//!            │  dispatch(Action) -> [HubOp] -> apply    │
//!            │  HubState · WorktreeManager · registries │
//!            └────────────────────┬─────────────────────┘
//!                                 │ HubEvent
//!                                 ▼
//!                          ClientRegistry ──► EventEnvelope{seq, generation}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut hub = Hub::new(config, repo_path)?;
//! hub.load_modules();
//! hub.start_socket_server(&Config::socket_path()?)?;
//! hub.run(&shutdown_flag)?;
//! ```

// Rust guideline compliant 2026-02

pub mod actions;
pub mod events;
pub mod hub_handle;
pub mod input;
pub mod lifecycle;
pub mod ops;
pub mod run;
pub mod server_comms;
pub mod state;


pub use actions::{Action, ActionContext, ActionRegistry, Dispatch};
pub use events::{EventEnvelope, HubEvent, PairingCode};
pub use hub_handle::HubHandle;
pub use input::HubInput;
pub use ops::{HubOp, SpawnRequest};
pub use state::{HubState, UiMode};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use data_encoding::BASE32_NOPAD;
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::agent::pty::PtyEvent;
use crate::agent::SessionNotification;
use crate::client::{ClientId, ClientRegistry};
use crate::config::Config;
use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::git::WorktreeManager;
use crate::hooks::HookRegistry;
use crate::modules::builtin::{LifecycleLog, LIFECYCLE_LOG};
use crate::modules::{Module, ModuleKind, ModuleRegistry};
use crate::sandbox::TrustTier;
use crate::server::{AgentHeartbeatInfo, ControlPlane, NotificationPayload};
use server_comms::ControlPlaneWorker;

/// Number of random bytes in a pairing code.
const PAIRING_CODE_BYTES: usize = 10;

/// Central orchestrator.
pub struct Hub {
    // === Core State ===
    /// Agents, focus and mode.
    pub state: HubState,
    /// Configuration the Hub was started with.
    pub config: Config,
    repo_path: PathBuf,
    repo_name: String,
    worktrees: WorktreeManager,

    // === Extensions ===
    hooks: HookRegistry,
    actions: ActionRegistry,
    modules: ModuleRegistry,

    // === Clients ===
    clients: ClientRegistry,
    input_tx: UnboundedSender<HubInput>,
    input_rx: UnboundedReceiver<HubInput>,
    /// PTY event subscriptions keyed by `(agent_key, session_index)`.
    session_events: BTreeMap<(String, usize), broadcast::Receiver<PtyEvent>>,

    // === Runtime ===
    /// Hosts the socket server tasks.
    tokio_runtime: tokio::runtime::Runtime,
    socket_server: Option<crate::socket::SocketServer>,
    control_plane: Option<ControlPlaneWorker>,
    hub_id: Option<String>,
    connection_code: Option<PairingCode>,
    /// Size new sessions start at (rows, cols).
    pty_size: (u16, u16),
    last_heartbeat: Instant,
    cleanup_on_shutdown: bool,

    /// Whether the control loop should stop.
    pub quit: bool,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("repo_path", &self.repo_path)
            .field("agents", &self.state.len())
            .field("clients", &self.clients.len())
            .field("modules", &self.modules.len())
            .field("quit", &self.quit)
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Creates a Hub serving the repository at `repo_path`.
    ///
    /// Registers the built-in modules. Script modules are loaded separately
    /// with [`Hub::load_modules`].
    ///
    /// # Errors
    ///
    /// Returns an error if the repository name cannot be determined or the
    /// async runtime cannot be created.
    pub fn new(config: Config, repo_path: PathBuf) -> Result<Self> {
        let repo_name = crate::git::repo_name(&repo_path)?;
        let worktrees = WorktreeManager::new(config.worktree_base.clone())
            .with_timeouts(config.init_timeout(), config.teardown_timeout());
        let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hub-io")
            .enable_all()
            .build()
            .context("Failed to create async runtime")?;
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let mut hub = Self {
            state: HubState::new(),
            repo_path,
            repo_name,
            worktrees,
            hooks: HookRegistry::new(Duration::from_millis(config.interceptor_timeout_ms)),
            actions: ActionRegistry::with_builtin(),
            modules: ModuleRegistry::new(config.agent_scope()),
            clients: ClientRegistry::new(),
            input_tx,
            input_rx,
            session_events: BTreeMap::new(),
            tokio_runtime,
            socket_server: None,
            control_plane: None,
            hub_id: None,
            connection_code: None,
            pty_size: (DEFAULT_ROWS, DEFAULT_COLS),
            last_heartbeat: Instant::now(),
            cleanup_on_shutdown: false,
            quit: false,
            config,
        };

        hub.modules.register(
            LIFECYCLE_LOG,
            ModuleKind::Protected,
            TrustTier::Core,
            Box::new(|| Ok(Box::new(LifecycleLog) as Box<dyn Module>)),
            &mut hub.hooks,
            &mut hub.actions,
        )?;

        log::info!("Hub ready for {} at {}", hub.repo_name, hub.repo_path.display());
        Ok(hub)
    }

    /// Handle for submitting input from other threads.
    #[must_use]
    pub fn handle(&self) -> HubHandle {
        HubHandle::new(self.input_tx.clone())
    }

    /// Primary checkout this Hub serves.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Repository name used in agent keys.
    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    /// Hook registry, for in-process extensions.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Module registry.
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Registers a compiled-in module.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the module fails to load.
    pub fn register_module(
        &mut self,
        name: &str,
        kind: ModuleKind,
        tier: TrustTier,
        factory: crate::modules::ModuleFactory,
    ) -> Result<()> {
        self.modules
            .register(name, kind, tier, factory, &mut self.hooks, &mut self.actions)?;
        Ok(())
    }

    /// Loads every script in the configured modules directory.
    ///
    /// Returns the number of modules loaded.
    pub fn load_modules(&mut self) -> usize {
        let Some(dir) = self.config.modules_dir.clone() else {
            return 0;
        };
        let handle = self.handle();
        match crate::lua::load_dir(
            &dir,
            &mut self.modules,
            &mut self.hooks,
            &mut self.actions,
            Some(&handle),
        ) {
            Ok(count) => {
                log::info!("Loaded {count} module(s) from {}", dir.display());
                count
            }
            Err(e) => {
                log::warn!("Failed to load modules from {}: {e:#}", dir.display());
                0
            }
        }
    }

    /// Starts the module hot-reload watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if no modules directory is configured or it cannot
    /// be watched.
    pub fn watch_modules(&self) -> Result<std::thread::JoinHandle<()>> {
        let dir = self
            .config
            .modules_dir
            .clone()
            .context("No modules directory configured")?;
        crate::lua::ModuleWatcher::new(dir)?.forward_to(self.handle())
    }

    /// Starts the control-plane worker with `plane`.
    ///
    /// Replaces a running worker.
    pub fn attach_control_plane(&mut self, plane: Box<dyn ControlPlane>) {
        let interval = Duration::from_secs(self.config.poll_interval.max(1));
        self.control_plane = Some(ControlPlaneWorker::spawn(plane, self.handle(), interval));
        log::info!("Control-plane worker attached");
    }

    /// Identity used in pairing URLs.
    pub fn set_hub_id(&mut self, id: impl Into<String>) {
        self.hub_id = Some(id.into());
    }

    /// Whether worktrees are deleted when the Hub shuts down.
    pub fn set_cleanup_on_shutdown(&mut self, cleanup: bool) {
        self.cleanup_on_shutdown = cleanup;
    }

    /// Starts listening for peers on `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn start_socket_server(&mut self, path: &Path) -> Result<()> {
        let server =
            crate::socket::SocketServer::start(self.tokio_runtime.handle(), path, self.handle())?;
        self.socket_server = Some(server);
        Ok(())
    }

    // === Control loop ===

    /// One control-loop iteration: drain input, poll sessions, run module
    /// work and periodic tasks.
    pub fn tick(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            self.handle_input(input);
        }
        self.poll_sessions();
        self.modules.tick(&mut self.hooks, &mut self.actions);
        self.maybe_heartbeat();
    }

    fn handle_input(&mut self, input: HubInput) {
        match input {
            HubInput::Action(action) => self.handle_action(action),
            HubInput::ClientConnected { id, sender } => {
                self.clients.register(id.clone(), sender);
                self.send_snapshot(&id);
            }
            HubInput::ClientDisconnected { id } => {
                self.clients.unregister(&id);
            }
            HubInput::ModulesChanged { modules } => {
                let Some(dir) = self.config.modules_dir.clone() else {
                    return;
                };
                let handle = self.handle();
                crate::lua::apply_changes(
                    &dir,
                    &modules,
                    &mut self.modules,
                    &mut self.hooks,
                    &mut self.actions,
                    Some(&handle),
                );
            }
            HubInput::Shutdown => self.quit = true,
        }
    }

    /// Dispatches `action` and applies the resulting ops in order.
    pub fn handle_action(&mut self, action: Action) {
        let ctx = ActionContext::capture(&self.state, &action.source);
        match actions::dispatch(&self.actions, &ctx, &action) {
            Ok(Dispatch::Ops(ops)) => {
                for op in ops {
                    self.apply_op(op, &action.source);
                }
            }
            Ok(Dispatch::Forward(data)) => self.forward_input(&data, &action.source),
            Ok(Dispatch::Ignored) => {}
            Err(e) => self.send_error(&action.source, format!("{e:#}")),
        }

        if let Some(id) = &action.work_item_id {
            match (id.parse::<i64>(), &self.control_plane) {
                (Ok(id), Some(worker)) => worker.acknowledge(id),
                (Err(_), _) => log::warn!("Work item id '{id}' is not numeric"),
                _ => {}
            }
        }
    }

    /// Applies one op. Failures are reported to `source`.
    pub fn apply_op(&mut self, op: HubOp, source: &ClientId) {
        log::debug!("Applying {op:?}");
        match op {
            HubOp::SetMode { mode } => self.state.mode = mode,
            HubOp::SpawnAgent(req) => self.spawn_agent(req, source),
            HubOp::CloseAgent {
                agent_key,
                delete_worktree,
            } => {
                let Some(key) = agent_key.or_else(|| self.state.focused().map(str::to_string)) else {
                    self.send_error(source, "No agent to close".to_string());
                    return;
                };
                if let Err(e) = self.close_agent(&key, delete_worktree) {
                    self.send_error(source, format!("{e:#}"));
                }
            }
            HubOp::Focus { agent_key } => {
                if self.state.focus(&agent_key) {
                    self.broadcast_focus();
                } else {
                    self.send_error(source, format!("No agent '{agent_key}'"));
                }
            }
            HubOp::FocusNext => {
                if self.state.focus_next().is_some() {
                    self.broadcast_focus();
                }
            }
            HubOp::FocusPrevious => {
                if self.state.focus_previous().is_some() {
                    self.broadcast_focus();
                }
            }
            HubOp::FocusSession { session } => {
                if self.state.focus_session(session) {
                    self.broadcast_focus();
                } else {
                    self.send_error(source, format!("No session {session}"));
                }
            }
            HubOp::WriteInput {
                agent_key,
                session,
                data,
            } => {
                let Some(key) = agent_key.or_else(|| self.state.focused().map(str::to_string)) else {
                    self.send_error(source, "No agent to write to".to_string());
                    return;
                };
                let session = session.unwrap_or_else(|| self.state.focused_session());
                let result = match self.state.get(&key) {
                    Some(agent) => agent.write_input(session, data.as_bytes()),
                    None => Err(anyhow::anyhow!("No agent '{key}'")),
                };
                if let Err(e) = result {
                    self.send_error(source, format!("{e:#}"));
                }
            }
            HubOp::Resize { rows, cols } => {
                if rows == 0 || cols == 0 {
                    self.send_error(source, format!("Invalid terminal size {rows}x{cols}"));
                    return;
                }
                self.pty_size = (rows, cols);
                for agent in self.state.agents() {
                    if let Err(e) = agent.resize(rows, cols) {
                        log::warn!("Resize of {} failed: {e:#}", agent.key());
                    }
                }
            }
            HubOp::Scroll { direction } => {
                let index = self.state.focused_session();
                if let Some(session) = self.state.focused_agent().and_then(|a| a.session(index)) {
                    session.scroll(direction);
                }
            }
            HubOp::SetMetadata {
                agent_key,
                key,
                value,
            } => self.set_metadata(agent_key, key, value, source),
            HubOp::Notify { agent_key, message } => {
                let agent_key = agent_key
                    .or_else(|| self.state.focused().map(str::to_string))
                    .unwrap_or_default();
                self.forward_notification(agent_key, message);
            }
            HubOp::ShowError { message } => self.send_error(source, message),
            HubOp::RefreshWorktrees => self.broadcast_worktrees(),
            HubOp::ShowConnectionCode => self.show_connection_code(),
            HubOp::ClearConnectionCode => {
                self.connection_code = None;
                if self.state.mode == UiMode::ConnectionCode {
                    self.state.mode = UiMode::Normal;
                }
                self.broadcast(HubEvent::ConnectionCode { pairing: None });
            }
            HubOp::SendScreen { agent_key, session } => self.send_screen(agent_key, session, source),
            HubOp::SendSnapshot => self.send_snapshot(source),
            HubOp::Quit => {
                log::info!("Quit requested by {source}");
                self.quit = true;
            }
        }
    }

    fn forward_input(&mut self, data: &[u8], source: &ClientId) {
        let index = self.state.focused_session();
        let result = match self.state.focused_agent() {
            Some(agent) => agent.write_input(index, data),
            None => return,
        };
        if let Err(e) = result {
            self.send_error(source, format!("{e:#}"));
        }
    }

    fn set_metadata(&mut self, agent_key: Option<String>, key: String, value: Value, source: &ClientId) {
        let Some(target) = agent_key.or_else(|| self.state.focused().map(str::to_string)) else {
            self.send_error(source, "No agent for metadata".to_string());
            return;
        };
        let Some(agent) = self.state.get_mut(&target) else {
            self.send_error(source, format!("No agent '{target}'"));
            return;
        };
        if value.is_null() {
            agent.metadata.remove(&key);
        } else {
            agent.metadata.insert(key, value);
        }
        let info = agent.info();
        self.broadcast(HubEvent::AgentCreated { agent: info, focus: false });
    }

    fn forward_notification(&self, agent_key: String, message: String) {
        match &self.control_plane {
            Some(worker) => worker.notify(NotificationPayload { agent_key, message }),
            None => log::debug!("No control-plane; notification for {agent_key} kept local"),
        }
    }

    fn send_screen(&mut self, agent_key: Option<String>, session: Option<usize>, source: &ClientId) {
        let Some(key) = agent_key.or_else(|| self.state.focused().map(str::to_string)) else {
            self.send_error(source, "No agent selected".to_string());
            return;
        };
        let session = session.unwrap_or_else(|| self.state.focused_session());
        let snapshot = self
            .state
            .get(&key)
            .and_then(|a| a.session(session))
            .map(|s| s.snapshot());
        match snapshot {
            Some(snapshot) => {
                self.send_to(
                    source,
                    HubEvent::ScreenSnapshot {
                        agent_key: key,
                        session,
                        snapshot,
                    },
                );
            }
            None => self.send_error(source, format!("No session {session} on '{key}'")),
        }
    }

    fn show_connection_code(&mut self) {
        let pairing = match self.generate_pairing_code() {
            Ok(pairing) => pairing,
            Err(e) => {
                log::warn!("Connection code unavailable: {e:#}");
                self.broadcast(HubEvent::ConnectionCodeError {
                    error: format!("{e:#}"),
                });
                return;
            }
        };
        self.connection_code = Some(pairing.clone());
        self.state.mode = UiMode::ConnectionCode;
        self.broadcast(HubEvent::ConnectionCode {
            pairing: Some(pairing),
        });
    }

    fn generate_pairing_code(&self) -> Result<PairingCode> {
        if self.config.server_url.is_empty() {
            anyhow::bail!("No control-plane server configured");
        }
        let hub_id = self.hub_id.as_deref().context("Hub id not set")?;
        let mut bytes = [0u8; PAIRING_CODE_BYTES];
        rand::rng().fill(&mut bytes);
        Ok(PairingCode {
            url: format!(
                "{}/hubs/{hub_id}/pair",
                self.config.server_url.trim_end_matches('/')
            ),
            code: BASE32_NOPAD.encode(&bytes),
        })
    }

    // === Session events ===

    fn poll_sessions(&mut self) {
        let mut events = Vec::new();
        let mut closed = Vec::new();
        for ((key, index), rx) in &mut self.session_events {
            loop {
                match rx.try_recv() {
                    Ok(event) => events.push((key.clone(), *index, event)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(n)) => {
                        log::debug!("{key}:{index} skipped {n} PTY events");
                    }
                    Err(TryRecvError::Closed) => {
                        closed.push((key.clone(), *index));
                        break;
                    }
                }
            }
        }
        for id in closed {
            self.session_events.remove(&id);
        }

        for (key, index, event) in events {
            match event {
                PtyEvent::Notification(notification) => {
                    self.handle_notification(&key, index, &notification);
                }
                PtyEvent::ProcessExited { exit_code } if index == 0 => {
                    self.primary_session_exited(&key, exit_code);
                }
                _ => {}
            }
        }
    }

    fn handle_notification(&mut self, key: &str, index: usize, notification: &SessionNotification) {
        let value = serde_json::to_value(notification).unwrap_or(Value::Null);
        self.hooks
            .notify("agent_notification", &Self::notification_payload(key, index, &value));
        self.forward_notification(key.to_string(), notification.message());
    }

    fn maybe_heartbeat(&mut self) {
        let Some(worker) = &self.control_plane else {
            return;
        };
        if self.last_heartbeat.elapsed() < Duration::from_secs(self.config.heartbeat_interval) {
            return;
        }
        self.last_heartbeat = Instant::now();
        let roster = self
            .state
            .agents()
            .map(|a| AgentHeartbeatInfo {
                session_key: a.key().to_string(),
                status: a.status().as_str().to_string(),
                issue_number: a.issue_number,
            })
            .collect();
        worker.heartbeat(roster);
    }

    // === Client fan-out ===

    pub(crate) fn broadcast(&mut self, event: HubEvent) {
        self.clients.broadcast(self.state.generation(), &event);
    }

    /// Tells every client where Hub focus is now.
    pub(crate) fn broadcast_focus(&mut self) {
        self.broadcast(HubEvent::FocusChanged {
            agent_key: self.state.focused().map(str::to_string),
            session: self.state.focused_session(),
        });
    }

    fn send_to(&mut self, id: &ClientId, event: HubEvent) {
        if id.is_client() {
            self.clients.send_to(id, self.state.generation(), event);
        }
    }

    pub(crate) fn send_error(&mut self, id: &ClientId, message: String) {
        log::warn!("Error for {id}: {message}");
        self.send_to(id, HubEvent::Error { message });
    }

    pub(crate) fn broadcast_worktrees(&mut self) {
        match self.worktrees.list(&self.repo_path) {
            Ok(worktrees) => self.broadcast(HubEvent::WorktreeList {
                repo_path: Some(self.repo_path.clone()),
                worktrees,
            }),
            Err(e) => log::warn!("Failed to list worktrees: {e:#}"),
        }
    }

    /// Sends the full state to one client: agents, worktrees, profiles and
    /// any pairing code on display.
    fn send_snapshot(&mut self, id: &ClientId) {
        self.send_to(
            id,
            HubEvent::AgentList {
                agents: self.state.infos(),
                focused: self.state.focused().map(str::to_string),
            },
        );
        match self.worktrees.list(&self.repo_path) {
            Ok(worktrees) => self.send_to(
                id,
                HubEvent::WorktreeList {
                    repo_path: Some(self.repo_path.clone()),
                    worktrees,
                },
            ),
            Err(e) => log::warn!("Failed to list worktrees: {e:#}"),
        }
        self.send_to(
            id,
            HubEvent::Profiles {
                profiles: self.config.profile_names(),
            },
        );
        if let Some(pairing) = self.connection_code.clone() {
            self.send_to(id, HubEvent::ConnectionCode { pairing: Some(pairing) });
        }
    }

    // === Shutdown ===

    /// Fires `shutdown`, closes every agent and stops the worker.
    ///
    /// Worktrees are deleted only when cleanup was requested.
    pub fn shutdown(&mut self) {
        log::info!("Hub shutting down");
        self.hooks.notify("shutdown", &Value::Null);
        let keys = self.state.keys().to_vec();
        for key in keys {
            if let Err(e) = self.close_agent(&key, self.cleanup_on_shutdown) {
                log::warn!("Close of {key} during shutdown failed: {e:#}");
            }
        }
        if let Some(worker) = self.control_plane.take() {
            worker.shutdown();
        }
        if let Some(server) = self.socket_server.take() {
            server.shutdown();
        }
    }
}
