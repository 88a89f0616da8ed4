//! Hub state: the agent registry, focus and UI mode.
//!
//! Owned by the Hub control loop and mutated only there. The generation
//! counter moves on every structural change (agent inserted or removed) and
//! is stamped on every outbound event so clients can detect stale mirrors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentInfo};

/// Input routing mode. Never stores agent data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UiMode {
    /// Keystrokes go to the focused session.
    #[default]
    Normal,
    /// Hub menu open.
    Menu,
    /// Picking an existing worktree.
    SelectWorktree,
    /// Entering a branch name for a new worktree.
    CreateWorktree,
    /// Free-text prompt.
    Prompt,
    /// Confirming an agent close.
    CloseConfirm,
    /// Pairing code on screen.
    ConnectionCode,
    /// Error on screen.
    Error,
}

impl UiMode {
    /// Whether unhandled raw input is forwarded to the focused session.
    pub fn is_interactive(self) -> bool {
        self == Self::Normal
    }

    /// Wire name, e.g. `close-confirm`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Menu => "menu",
            Self::SelectWorktree => "select-worktree",
            Self::CreateWorktree => "create-worktree",
            Self::Prompt => "prompt",
            Self::CloseConfirm => "close-confirm",
            Self::ConnectionCode => "connection-code",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for UiMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| anyhow::anyhow!("unknown mode '{s}'"))
    }
}

impl std::fmt::Display for UiMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry of live agents plus focus.
#[derive(Default)]
pub struct HubState {
    order: Vec<String>,
    agents: HashMap<String, Agent>,
    worktrees_in_use: HashMap<PathBuf, String>,
    focused: Option<String>,
    focused_session: usize,
    generation: u64,
    /// Current input routing mode.
    pub mode: UiMode,
}

impl std::fmt::Debug for HubState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubState")
            .field("agents", &self.order)
            .field("focused", &self.focused)
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl HubState {
    /// Empty state at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Adds an agent at the end of the order.
    ///
    /// Refuses duplicate keys and worktrees already owned by another agent.
    pub fn insert(&mut self, agent: Agent) -> Result<()> {
        let key = agent.key().to_string();
        if self.agents.contains_key(&key) {
            bail!("Agent {key} already exists");
        }
        if let Some(path) = agent.worktree_path() {
            self.claim_worktree(path, &key)?;
        }
        self.order.push(key.clone());
        self.agents.insert(key, agent);
        self.generation += 1;
        Ok(())
    }

    /// Removes an agent, releasing its worktree and moving focus off it.
    pub fn remove(&mut self, key: &str) -> Option<Agent> {
        let agent = self.agents.remove(key)?;
        let idx = self.order.iter().position(|k| k == key);
        if let Some(idx) = idx {
            self.order.remove(idx);
        }
        if let Some(path) = agent.worktree_path() {
            self.release_worktree(path);
        }
        if self.focused.as_deref() == Some(key) {
            self.focused = idx.and_then(|i| self.order.get(i).or_else(|| self.order.last()).cloned());
            self.focused_session = 0;
        }
        self.generation += 1;
        Some(agent)
    }

    /// Agent by key.
    pub fn get(&self, key: &str) -> Option<&Agent> {
        self.agents.get(key)
    }

    /// Mutable agent by key.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Agent> {
        self.agents.get_mut(key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.agents.contains_key(key)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    /// Agents in insertion order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.order.iter().filter_map(|k| self.agents.get(k))
    }

    /// Mutable agents, unordered.
    pub fn agents_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.values_mut()
    }

    /// Serializable records in insertion order.
    pub fn infos(&self) -> Vec<AgentInfo> {
        self.agents().map(Agent::info).collect()
    }

    /// Number of agents.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// No agents.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Focused agent key.
    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    /// Focused agent.
    pub fn focused_agent(&self) -> Option<&Agent> {
        self.focused.as_deref().and_then(|k| self.agents.get(k))
    }

    /// Session index shown for the focused agent.
    pub fn focused_session(&self) -> usize {
        self.focused_session
    }

    /// Focuses `key` on its primary session. Returns false for unknown keys.
    pub fn focus(&mut self, key: &str) -> bool {
        if !self.agents.contains_key(key) {
            return false;
        }
        if self.focused.as_deref() != Some(key) {
            self.focused = Some(key.to_string());
            self.focused_session = 0;
        }
        true
    }

    /// Focuses a session of the focused agent. Returns false if it does not exist.
    pub fn focus_session(&mut self, index: usize) -> bool {
        match self.focused_agent() {
            Some(agent) if agent.session(index).is_some() => {
                self.focused_session = index;
                true
            }
            _ => false,
        }
    }

    /// Moves focus forward, wrapping around.
    pub fn focus_next(&mut self) -> Option<&str> {
        self.step_focus(1)
    }

    /// Moves focus backward, wrapping around.
    pub fn focus_previous(&mut self) -> Option<&str> {
        self.step_focus(-1)
    }

    fn step_focus(&mut self, delta: isize) -> Option<&str> {
        if self.order.is_empty() {
            return None;
        }
        let len = self.order.len() as isize;
        let next = match self
            .focused
            .as_ref()
            .and_then(|k| self.order.iter().position(|o| o == k))
        {
            Some(i) => (i as isize + delta).rem_euclid(len),
            None => 0,
        };
        let key = self.order[next as usize].clone();
        self.focus(&key);
        self.focused.as_deref()
    }

    /// Marks `path` as owned by `key`.
    pub fn claim_worktree(&mut self, path: &Path, key: &str) -> Result<()> {
        match self.worktrees_in_use.get(path) {
            Some(owner) if owner != key => {
                bail!("Worktree {} is in use by agent {owner}", path.display())
            }
            _ => {
                self.worktrees_in_use
                    .insert(path.to_path_buf(), key.to_string());
                Ok(())
            }
        }
    }

    /// Releases a worktree claim.
    pub fn release_worktree(&mut self, path: &Path) {
        self.worktrees_in_use.remove(path);
    }

    /// Agent owning `path`, if claimed.
    pub fn worktree_owner(&self, path: &Path) -> Option<&str> {
        self.worktrees_in_use.get(path).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(branch: &str) -> Agent {
        Agent::new("repo", "/tmp/repo", branch, "default")
    }

    #[test]
    fn test_insert_bumps_generation_and_keeps_order() {
        let mut state = HubState::new();
        state.insert(agent("b")).unwrap();
        state.insert(agent("a")).unwrap();
        assert_eq!(state.generation(), 2);
        assert_eq!(state.keys(), ["repo-b", "repo-a"]);
    }

    #[test]
    fn test_duplicate_key_refused() {
        let mut state = HubState::new();
        state.insert(agent("b")).unwrap();
        assert!(state.insert(agent("b")).is_err());
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_worktree_claim_is_exclusive() {
        let mut state = HubState::new();
        let mut first = agent("one");
        first.set_worktree_path(PathBuf::from("/wt/x")).unwrap();
        state.insert(first).unwrap();

        let mut second = agent("two");
        second.set_worktree_path(PathBuf::from("/wt/x")).unwrap();
        assert!(state.insert(second).is_err());

        state.remove("repo-one");
        assert!(state.worktree_owner(Path::new("/wt/x")).is_none());
    }

    #[test]
    fn test_remove_moves_focus_to_next_then_previous() {
        let mut state = HubState::new();
        for b in ["a", "b", "c"] {
            state.insert(agent(b)).unwrap();
        }
        state.focus("repo-b");
        state.remove("repo-b");
        assert_eq!(state.focused(), Some("repo-c"));

        state.remove("repo-c");
        assert_eq!(state.focused(), Some("repo-a"));

        state.remove("repo-a");
        assert_eq!(state.focused(), None);
        assert_eq!(state.generation(), 6);
    }

    #[test]
    fn test_remove_unfocused_keeps_focus() {
        let mut state = HubState::new();
        state.insert(agent("a")).unwrap();
        state.insert(agent("b")).unwrap();
        state.focus("repo-a");
        state.remove("repo-b");
        assert_eq!(state.focused(), Some("repo-a"));
    }

    #[test]
    fn test_focus_cycles() {
        let mut state = HubState::new();
        assert_eq!(state.focus_next(), None);
        state.insert(agent("a")).unwrap();
        state.insert(agent("b")).unwrap();
        assert_eq!(state.focus_next(), Some("repo-a"));
        assert_eq!(state.focus_next(), Some("repo-b"));
        assert_eq!(state.focus_next(), Some("repo-a"));
        assert_eq!(state.focus_previous(), Some("repo-b"));
        assert!(!state.focus("missing"));
    }

    #[test]
    fn test_mode_names() {
        assert_eq!("close-confirm".parse::<UiMode>().unwrap(), UiMode::CloseConfirm);
        assert_eq!(UiMode::SelectWorktree.to_string(), "select-worktree");
        assert!("sideways".parse::<UiMode>().is_err());
        assert!(UiMode::Normal.is_interactive());
        assert!(!UiMode::Menu.is_interactive());
    }
}
