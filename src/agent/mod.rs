//! Agents: a worktree plus one or more terminal sessions.
//!
//! # Architecture
//!
//! ```text
//! Agent
//! +-- key: "<repo>-<branch>" (stable identity)
//! +-- worktree_path: Option<PathBuf> (set once the worktree exists)
//! +-- sessions: BTreeMap<usize, PtySession> (index 0 is primary)
//! +-- status: AgentStatus (driven by the Hub)
//! +-- metadata: key/value set by extensions
//! ```
//!
//! Agents own process state. View state (which session a client looks at,
//! scroll position on a remote surface) belongs to clients.
//!
//! # Submodules
//!
//! - [`notification`]: OSC 9 / OSC 777 detection
//! - [`pty`]: terminal sessions
//! - [`screen`]: immutable screen snapshots
//! - [`status`]: lifecycle state machine

// Rust guideline compliant 2026-02

pub mod notification;
pub mod pty;
pub mod screen;
pub mod spawn;
pub mod status;

pub use notification::{detect_notifications, SessionNotification};
pub use pty::{PtySession, ScrollDirection};
pub use screen::ScreenSnapshot;
pub use spawn::PtySpawnConfig;
pub use status::AgentStatus;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Builds the stable agent key from repository and branch.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `-`, so `owner/repo` on
/// `feature/login` yields `owner-repo-feature-login`.
pub fn agent_key(repo: &str, branch: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("{}-{}", sanitize(repo), sanitize(branch))
}

/// Public summary of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Index within the agent.
    pub index: usize,
    /// Session name from the profile.
    pub name: String,
    /// Whether the session's reading loop has stopped.
    pub terminated: bool,
}

/// Serializable agent record carried by events and client mirrors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Stable key.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Repository name.
    pub repo: String,
    /// Branch checked out in the worktree.
    pub branch_name: String,
    /// Issue or task number that triggered the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    /// Worktree location once created.
    #[serde(default)]
    pub worktree_path: Option<PathBuf>,
    /// Profile the sessions came from.
    pub profile: String,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Sessions in index order.
    pub sessions: Vec<SessionInfo>,
    /// Extension-provided metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A managed coding-session unit.
pub struct Agent {
    key: String,
    /// Display name.
    pub name: String,
    /// Repository name (e.g. `owner/repo`).
    pub repo: String,
    /// Primary checkout the worktree was created from.
    pub repo_path: PathBuf,
    /// Branch name.
    pub branch_name: String,
    /// Issue or task number, if any.
    pub issue_number: Option<u64>,
    /// Profile name.
    pub profile: String,
    /// Extension-provided metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    worktree_path: Option<PathBuf>,
    sessions: BTreeMap<usize, PtySession>,
    status: AgentStatus,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("key", &self.key)
            .field("branch_name", &self.branch_name)
            .field("status", &self.status)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// New agent in `creating_worktree` with no worktree or sessions yet.
    pub fn new(
        repo: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        let repo = repo.into();
        let branch_name = branch_name.into();
        Self {
            key: agent_key(&repo, &branch_name),
            name: branch_name.clone(),
            repo,
            repo_path: repo_path.into(),
            branch_name,
            issue_number: None,
            profile: profile.into(),
            metadata: BTreeMap::new(),
            worktree_path: None,
            sessions: BTreeMap::new(),
            status: AgentStatus::CreatingWorktree,
            created_at: Utc::now(),
        }
    }

    /// Stable key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current status.
    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    /// Moves to `next`, refusing transitions the state machine forbids.
    pub fn set_status(&mut self, next: AgentStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            bail!(
                "Agent {}: invalid transition {} -> {}",
                self.key,
                self.status,
                next
            );
        }
        log::debug!("Agent {}: {} -> {}", self.key, self.status, next);
        self.status = next;
        Ok(())
    }

    /// Worktree path, once assigned.
    pub fn worktree_path(&self) -> Option<&Path> {
        self.worktree_path.as_deref()
    }

    /// Assigns the worktree. A path can be assigned only once.
    pub fn set_worktree_path(&mut self, path: PathBuf) -> Result<()> {
        if let Some(existing) = &self.worktree_path {
            bail!(
                "Agent {} already owns worktree {}",
                self.key,
                existing.display()
            );
        }
        self.worktree_path = Some(path);
        Ok(())
    }

    /// Adds a session under `index`.
    pub fn add_session(&mut self, index: usize, session: PtySession) {
        self.sessions.insert(index, session);
    }

    /// Session by index.
    pub fn session(&self, index: usize) -> Option<&PtySession> {
        self.sessions.get(&index)
    }

    /// Mutable session by index.
    pub fn session_mut(&mut self, index: usize) -> Option<&mut PtySession> {
        self.sessions.get_mut(&index)
    }

    /// Sessions in index order.
    pub fn sessions(&self) -> impl Iterator<Item = (usize, &PtySession)> {
        self.sessions.iter().map(|(i, s)| (*i, s))
    }

    /// Number of sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Writes raw input to one session.
    pub fn write_input(&self, index: usize, data: &[u8]) -> Result<()> {
        self.session(index)
            .with_context(|| format!("Agent {} has no session {index}", self.key))?
            .write_input(data)
    }

    /// Resizes every session; stops at the first failure.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        for (index, session) in &self.sessions {
            session
                .resize(rows, cols)
                .with_context(|| format!("Agent {} session {index}", self.key))?;
        }
        Ok(())
    }

    /// Cancels every reading loop, kills the children and joins the reader
    /// threads. Returns once no session is reading.
    pub fn close_sessions(&mut self) {
        for session in self.sessions.values_mut() {
            session.shutdown();
        }
    }

    /// Serializable summary.
    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            key: self.key.clone(),
            name: self.name.clone(),
            repo: self.repo.clone(),
            branch_name: self.branch_name.clone(),
            issue_number: self.issue_number,
            worktree_path: self.worktree_path.clone(),
            profile: self.profile.clone(),
            status: self.status.clone(),
            sessions: self
                .sessions
                .iter()
                .map(|(index, s)| SessionInfo {
                    index: *index,
                    name: s.name().to_string(),
                    terminated: s.is_terminated(),
                })
                .collect(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_key_sanitizes() {
        assert_eq!(agent_key("owner/repo", "feature-1"), "owner-repo-feature-1");
        assert_eq!(agent_key("repo", "feature/login page"), "repo-feature-login-page");
        assert_eq!(agent_key("my.repo", "v1_2"), "my.repo-v1_2");
    }

    #[test]
    fn test_new_agent_starts_creating_worktree() {
        let agent = Agent::new("repo", "/tmp/repo", "feature-1", "default");
        assert_eq!(agent.key(), "repo-feature-1");
        assert_eq!(agent.status(), &AgentStatus::CreatingWorktree);
        assert!(agent.worktree_path().is_none());
        assert_eq!(agent.session_count(), 0);
    }

    #[test]
    fn test_set_status_enforces_machine() {
        let mut agent = Agent::new("repo", "/tmp/repo", "b", "default");
        assert!(agent.set_status(AgentStatus::Running).is_err());
        agent.set_status(AgentStatus::SpawningSessions).unwrap();
        agent.set_status(AgentStatus::Running).unwrap();
        agent.set_status(AgentStatus::Failed("exited".into())).unwrap();
        assert!(agent.set_status(AgentStatus::Stopping).is_err());
    }

    #[test]
    fn test_worktree_path_assigned_once() {
        let mut agent = Agent::new("repo", "/tmp/repo", "b", "default");
        agent.set_worktree_path(PathBuf::from("/tmp/wt/a")).unwrap();
        assert!(agent.set_worktree_path(PathBuf::from("/tmp/wt/b")).is_err());
        assert_eq!(agent.worktree_path(), Some(Path::new("/tmp/wt/a")));
    }

    #[test]
    fn test_info_round_trips_through_json() {
        let mut agent = Agent::new("repo", "/tmp/repo", "feature-1", "default");
        agent.issue_number = Some(42);
        agent
            .metadata
            .insert("ticket".into(), serde_json::json!("ABC-1"));

        let info = agent.info();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["key"], "repo-feature-1");
        assert_eq!(json["status"]["state"], "creating_worktree");
        assert_eq!(json["metadata"]["ticket"], "ABC-1");

        let back: AgentInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_write_input_to_missing_session_errors() {
        let agent = Agent::new("repo", "/tmp/repo", "b", "default");
        assert!(agent.write_input(3, b"x").is_err());
    }
}
