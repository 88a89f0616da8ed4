//! Agent lifecycle: spawn and close.
//!
//! Both run synchronously on the Hub control loop and emit one
//! `agent_status_changed` event per transition before starting the next
//! step, so clients can render progress.
//!
//! ```text
//! spawn:  before_agent_create (interceptor)
//!         creating_worktree -> worktree create/reuse
//!         spawning_sessions -> filter_session_env (interceptor) per session
//!         insert into state, agent_created, running
//!         any failure        -> failed, agent_deleted (record never inserted)
//!
//! close:  stopping -> cancel + join reading loops
//!         removing_worktree -> guarded delete (when requested)
//!         deleted -> removed from state, agent_deleted
//! ```
//!
//! Resource failures become a `failed` status; they never escape as errors
//! from the control loop.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use super::events::HubEvent;
use super::ops::SpawnRequest;
use super::Hub;
use crate::agent::{agent_key, Agent, AgentStatus, PtySession, PtySpawnConfig};
use crate::client::ClientId;
use crate::config::SessionDef;
use crate::git::ScriptEnv;

/// Interceptor fired with the spawn request before anything is created.
pub const BEFORE_AGENT_CREATE: &str = "before_agent_create";
/// Interceptor fired with `{agent_key, session, env}` before each session spawns.
pub const FILTER_SESSION_ENV: &str = "filter_session_env";

fn script_env(agent: &Agent) -> ScriptEnv {
    ScriptEnv {
        repo: agent.repo.clone(),
        branch: agent.branch_name.clone(),
        worktree_path: agent.worktree_path().map(PathBuf::from).unwrap_or_default(),
        issue_number: agent.issue_number,
        agent_key: Some(agent.key().to_string()),
    }
}

impl Hub {
    /// Moves `key` to `status` and emits the change. Returns false if the
    /// agent is unknown or the transition is refused.
    pub(super) fn transition(&mut self, key: &str, status: AgentStatus) -> bool {
        let Some(agent) = self.state.get_mut(key) else {
            return false;
        };
        if let Err(e) = agent.set_status(status.clone()) {
            log::warn!("{e}");
            return false;
        }
        self.emit_status(key, &status);
        true
    }

    pub(super) fn emit_status(&mut self, key: &str, status: &AgentStatus) {
        self.broadcast(HubEvent::AgentStatusChanged {
            agent_key: key.to_string(),
            status: status.clone(),
        });
        self.hooks.notify(
            "agent_status_changed",
            &json!({ "agent_key": key, "status": status }),
        );
    }

    fn emit_deleted(&mut self, key: &str) {
        self.broadcast(HubEvent::AgentDeleted {
            agent_key: key.to_string(),
        });
        self.hooks.notify("agent_deleted", &json!({ "agent_key": key }));
    }

    /// Runs the `before_agent_create` chain. `None` means blocked.
    fn intercept_spawn(&self, req: SpawnRequest) -> Option<SpawnRequest> {
        let input = match serde_json::to_value(&req) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Lifecycle] Cannot serialize spawn request: {e}");
                return Some(req);
            }
        };
        let output = self.hooks.call(BEFORE_AGENT_CREATE, input)?;
        match serde_json::from_value(output) {
            Ok(changed) => Some(changed),
            Err(e) => {
                log::warn!("[Lifecycle] {BEFORE_AGENT_CREATE} returned an invalid request, ignoring: {e}");
                Some(req)
            }
        }
    }

    /// Runs the `filter_session_env` chain. A dropped result injects nothing.
    fn filter_env(
        &self,
        key: &str,
        session: &str,
        env: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let input = json!({ "agent_key": key, "session": session, "env": env });
        let Some(output) = self.hooks.call(FILTER_SESSION_ENV, input) else {
            log::info!("[Lifecycle] {FILTER_SESSION_ENV} dropped the environment for {key}/{session}");
            return BTreeMap::new();
        };
        match output.get("env").cloned().map(serde_json::from_value) {
            Some(Ok(filtered)) => filtered,
            _ => {
                log::warn!("[Lifecycle] {FILTER_SESSION_ENV} returned no usable env, keeping original");
                env
            }
        }
    }

    /// Creates an agent for `req`. Failures are reported as events.
    pub(super) fn spawn_agent(&mut self, req: SpawnRequest, source: &ClientId) {
        let Some(req) = self.intercept_spawn(req) else {
            log::info!("[Lifecycle] Spawn blocked by {BEFORE_AGENT_CREATE}");
            self.send_error(source, "Agent creation was blocked by an extension".to_string());
            return;
        };

        let repo_path = req.repo_path.clone().unwrap_or_else(|| self.repo_path.clone());
        let repo = if repo_path == self.repo_path {
            self.repo_name.clone()
        } else {
            match crate::git::repo_name(&repo_path) {
                Ok(name) => name,
                Err(e) => {
                    self.send_error(source, format!("{e:#}"));
                    return;
                }
            }
        };

        let key = agent_key(&repo, &req.branch);
        if self.state.contains(&key) {
            log::info!("[Lifecycle] Agent {key} already exists");
            if req.focus && self.state.focus(&key) {
                self.broadcast_focus();
            }
            return;
        }
        if self.state.len() >= self.config.max_sessions {
            self.send_error(
                source,
                format!("Agent limit reached ({})", self.config.max_sessions),
            );
            return;
        }
        let profile_name = req.profile.clone().unwrap_or_else(|| "default".to_string());
        let Some(profile) = self.config.profile(req.profile.as_deref()).cloned() else {
            self.send_error(source, format!("Unknown profile '{profile_name}'"));
            return;
        };

        let mut agent = Agent::new(repo, repo_path.clone(), req.branch.clone(), profile_name);
        if let Some(name) = &req.name {
            agent.name.clone_from(name);
        }
        agent.issue_number = req.issue_number;
        agent.metadata.clone_from(&req.metadata);
        log::info!("[Lifecycle] Spawning {key} on {}", req.branch);

        self.emit_status(&key, &AgentStatus::CreatingWorktree);
        let created = match self.worktrees.create(
            &repo_path,
            &req.branch,
            req.base_ref.as_deref(),
            &script_env(&agent),
        ) {
            Ok(created) => created,
            Err(e) => return self.fail_spawn(agent, format!("worktree: {e:#}"), None, source),
        };
        if let Some(owner) = self.state.worktree_owner(&created.path) {
            let reason = format!("worktree {} is in use by {owner}", created.path.display());
            return self.fail_spawn(agent, reason, None, source);
        }
        // Only a checkout made for this spawn is removed if it fails.
        let discard = (!created.reused).then(|| created.path.clone());
        if let Err(e) = agent.set_worktree_path(created.path.clone()) {
            return self.fail_spawn(agent, format!("{e:#}"), discard, source);
        }

        if let Err(e) = agent.set_status(AgentStatus::SpawningSessions) {
            return self.fail_spawn(agent, format!("{e:#}"), discard, source);
        }
        self.emit_status(&key, &AgentStatus::SpawningSessions);

        let mut receivers = Vec::new();
        for (index, def) in profile.sessions.iter().enumerate() {
            match self.spawn_session(&agent, index, def) {
                Ok(session) => {
                    receivers.push((index, session.subscribe()));
                    agent.add_session(index, session);
                }
                Err(e) => {
                    let reason = format!("session '{}': {e:#}", def.name);
                    return self.fail_spawn(agent, reason, discard, source);
                }
            }
        }

        if let Err(e) = agent.set_status(AgentStatus::Running) {
            return self.fail_spawn(agent, format!("{e:#}"), discard, source);
        }
        let info = agent.info();
        if let Err(e) = self.state.insert(agent) {
            log::error!("[Lifecycle] Insert of {key} failed: {e:#}");
            self.send_error(source, format!("{e:#}"));
            return;
        }
        for (index, rx) in receivers {
            self.session_events.insert((key.clone(), index), rx);
        }
        if req.focus {
            self.state.focus(&key);
        }

        self.broadcast(HubEvent::AgentCreated {
            agent: info.clone(),
            focus: req.focus,
        });
        self.emit_status(&key, &AgentStatus::Running);
        match serde_json::to_value(&info) {
            Ok(payload) => {
                self.hooks.notify("agent_created", &payload);
            }
            Err(e) => log::warn!("[Lifecycle] Cannot serialize {key}: {e}"),
        }
        if !created.reused {
            self.broadcast_worktrees();
        }
    }

    fn spawn_session(&self, agent: &Agent, index: usize, def: &SessionDef) -> Result<PtySession> {
        let cwd = agent
            .worktree_path()
            .context("Agent has no worktree")?
            .to_path_buf();

        let mut env = script_env(agent).vars();
        env.insert("AGENT_HUB_SESSION_NAME".to_string(), def.name.clone());
        env.insert("AGENT_HUB_SESSION_INDEX".to_string(), index.to_string());
        let env = self.filter_env(agent.key(), &def.name, env);

        let mut config = PtySpawnConfig::new(
            format!("{}:{}", agent.key(), def.name),
            cwd,
            def.command.clone(),
        );
        config.env = env;
        config.init_commands.clone_from(&def.init_commands);
        config.rows = self.pty_size.0;
        config.cols = self.pty_size.1;
        PtySession::spawn(config)
    }

    /// Reports a failed spawn. `discard` is a checkout created for it,
    /// removed after the sessions are closed. The branch is kept.
    fn fail_spawn(
        &mut self,
        mut agent: Agent,
        reason: String,
        discard: Option<PathBuf>,
        source: &ClientId,
    ) {
        let key = agent.key().to_string();
        log::error!("[Lifecycle] Spawn of {key} failed: {reason}");
        agent.close_sessions();
        if let Some(path) = discard {
            if let Err(e) = self.worktrees.delete(&path, "", &script_env(&agent)) {
                log::warn!(
                    "[Lifecycle] Leaving worktree {} of failed spawn {key}: {e:#}",
                    path.display()
                );
            }
        }
        self.emit_status(&key, &AgentStatus::Failed(reason.clone()));
        self.emit_deleted(&key);
        self.send_error(source, format!("Failed to start {key}: {reason}"));
    }

    /// Closes `key`. Idempotent once a close has started.
    ///
    /// Sessions are cancelled and joined before the worktree is touched.
    /// A failed worktree deletion (including a safety refusal) is reported
    /// as a `failed` status; the agent is removed either way.
    pub(super) fn close_agent(&mut self, key: &str, delete_worktree: bool) -> Result<()> {
        let Some(agent) = self.state.get(key) else {
            bail!("No agent '{key}'");
        };
        if agent.status().is_closing() {
            log::debug!("[Lifecycle] {key} is already closing");
            return Ok(());
        }
        let failed = agent.status().is_terminal();
        log::info!("[Lifecycle] Closing {key} (delete_worktree={delete_worktree})");

        if !failed {
            self.transition(key, AgentStatus::Stopping);
        }
        if let Some(agent) = self.state.get_mut(key) {
            agent.close_sessions();
        }
        self.session_events.retain(|(k, _), _| k != key);

        let mut deletion_failed = false;
        let target = self
            .state
            .get(key)
            .and_then(|a| a.worktree_path().map(|p| (p.to_path_buf(), a.branch_name.clone(), script_env(a))));
        if delete_worktree {
            if let Some((path, branch, env)) = target {
                if !failed {
                    self.transition(key, AgentStatus::RemovingWorktree);
                }
                if let Err(e) = self.worktrees.delete(&path, &branch, &env) {
                    log::error!("[Lifecycle] Worktree delete for {key} failed: {e:#}");
                    deletion_failed = true;
                    if !failed {
                        self.transition(key, AgentStatus::Failed(format!("worktree delete: {e:#}")));
                    }
                }
            }
        }

        if !failed && !deletion_failed {
            self.transition(key, AgentStatus::Deleted);
        }
        self.state.remove(key);
        self.emit_deleted(key);
        if delete_worktree && !deletion_failed {
            self.broadcast_worktrees();
        }
        Ok(())
    }

    /// Marks `key` failed when its primary session's process ends.
    pub(super) fn primary_session_exited(&mut self, key: &str, exit_code: Option<i32>) {
        let Some(agent) = self.state.get_mut(key) else {
            return;
        };
        if agent.status() != &AgentStatus::Running {
            return;
        }
        let (name, reaped) = agent
            .session_mut(0)
            .map_or_else(|| ("session 0".to_string(), None), |s| (s.name().to_string(), s.exit_code()));
        let exit_code = exit_code.or(reaped);
        let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        self.transition(key, AgentStatus::Failed(format!("{name} exited (code {code})")));
    }

    /// Payload for observers of `agent_notification`.
    pub(super) fn notification_payload(key: &str, session: usize, notification: &Value) -> Value {
        json!({ "agent_key": key, "session": session, "notification": notification })
    }
}
