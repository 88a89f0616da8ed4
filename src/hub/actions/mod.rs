//! Action dispatch.
//!
//! Every input (keystroke, socket peer, control-plane work item) becomes a
//! named [`Action`] with a JSON payload. The dispatcher looks up a handler by
//! `(name, mode)`, falling back to a mode-independent handler, and finally
//! to forwarding raw input to the focused session when the mode is
//! interactive.
//!
//! Handlers see an [`ActionContext`] (a read-only copy of the relevant Hub
//! state) and return [`HubOp`]s; they never touch the Hub directly. Built-in
//! handlers live in `builtin.rs`; modules add their own through
//! [`crate::modules::ModuleContext::register_action`].
//!
//! # Module Structure
//!
//! - `mod.rs` - Action, ActionRegistry and dispatch()
//! - `builtin.rs` - the stock action vocabulary

mod builtin;

pub use builtin::register_builtin;

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::ops::HubOp;
use super::state::{HubState, UiMode};
use crate::agent::AgentInfo;
use crate::client::ClientId;

/// A named request with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Action name, e.g. `spawn_agent`.
    pub name: String,
    /// Handler-specific payload.
    pub payload: Value,
    /// Who asked.
    pub source: ClientId,
    /// Raw terminal input, forwarded when no handler claims the action.
    pub raw_input: Option<Vec<u8>>,
    /// Control-plane work item to acknowledge once handled.
    pub work_item_id: Option<String>,
}

impl Action {
    /// Action from an internal source.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            source: ClientId::Internal,
            raw_input: None,
            work_item_id: None,
        }
    }

    /// Raw keystrokes from `source`.
    pub fn input(source: ClientId, data: Vec<u8>) -> Self {
        Self {
            name: "input".to_string(),
            payload: Value::Null,
            source,
            raw_input: Some(data),
            work_item_id: None,
        }
    }

    /// Sets the source.
    #[must_use]
    pub fn from_client(mut self, source: ClientId) -> Self {
        self.source = source;
        self
    }

    /// Attaches a work item to acknowledge.
    #[must_use]
    pub fn with_work_item(mut self, id: impl Into<String>) -> Self {
        self.work_item_id = Some(id.into());
        self
    }

    /// Parses a wire message `{"action": name, "payload": {...}}`.
    pub fn from_wire(msg: &Value, source: ClientId) -> Result<Self> {
        let name = msg
            .get("action")
            .and_then(Value::as_str)
            .context("Message has no 'action' field")?;
        let payload = msg.get("payload").cloned().unwrap_or(Value::Null);
        Ok(Self::new(name, payload).from_client(source))
    }

    /// Deserializes the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = if self.payload.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(payload).with_context(|| format!("Invalid payload for '{}'", self.name))
    }
}

/// Read-only view of Hub state handed to handlers.
#[derive(Debug, Clone, Serialize)]
pub struct ActionContext {
    /// Current mode.
    pub mode: UiMode,
    /// Focused agent key.
    pub focused_agent: Option<String>,
    /// Focused session index.
    pub focused_session: usize,
    /// Agents in Hub order.
    pub agents: Vec<AgentInfo>,
    /// Requesting client.
    pub source: String,
}

impl ActionContext {
    /// Captures the state relevant to handling an action from `source`.
    pub fn capture(state: &HubState, source: &ClientId) -> Self {
        Self {
            mode: state.mode,
            focused_agent: state.focused().map(str::to_string),
            focused_session: state.focused_session(),
            agents: state.infos(),
            source: source.to_string(),
        }
    }
}

/// Action handler.
pub type ActionHandler = Rc<dyn Fn(&ActionContext, &Action) -> Result<Vec<HubOp>>>;

type ActionKey = (String, Option<UiMode>);

#[derive(Clone)]
struct Entry {
    handler: ActionHandler,
    owner: Option<String>,
}

/// A registration removed by [`ActionRegistry::take_owned`].
#[derive(Clone)]
pub struct SavedAction {
    key: ActionKey,
    entry: Entry,
}

impl std::fmt::Debug for SavedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedAction").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Handlers keyed by `(name, mode)`; `None` mode matches every mode.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKey, Entry>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Registry with the built-in vocabulary.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        register_builtin(&mut registry);
        registry
    }

    /// Registers (or replaces) a handler.
    pub fn register(&mut self, name: &str, mode: Option<UiMode>, handler: ActionHandler, owner: Option<String>) {
        self.handlers
            .insert((name.to_string(), mode), Entry { handler, owner });
    }

    /// Removes a handler. Returns whether it existed.
    pub fn unregister(&mut self, name: &str, mode: Option<UiMode>) -> bool {
        self.handlers.remove(&(name.to_string(), mode)).is_some()
    }

    /// Handler for `name` in `mode`: mode-specific first, then mode-independent.
    pub fn resolve(&self, name: &str, mode: UiMode) -> Option<ActionHandler> {
        self.handlers
            .get(&(name.to_string(), Some(mode)))
            .or_else(|| self.handlers.get(&(name.to_string(), None)))
            .map(|e| e.handler.clone())
    }

    /// Removes and returns every handler owned by `owner`.
    pub fn take_owned(&mut self, owner: &str) -> Vec<SavedAction> {
        let keys: Vec<ActionKey> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.owner.as_deref() == Some(owner))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                self.handlers
                    .remove(&key)
                    .map(|entry| SavedAction { key, entry })
            })
            .collect()
    }

    /// Puts back handlers from [`take_owned`](Self::take_owned) unless the key was taken meanwhile.
    pub fn restore(&mut self, saved: Vec<SavedAction>) {
        for SavedAction { key, entry } in saved {
            self.handlers.entry(key).or_insert(entry);
        }
    }

    /// Drops every handler owned by `owner`; returns how many.
    pub fn clear_owner(&mut self, owner: &str) -> usize {
        self.take_owned(owner).len()
    }

    /// Distinct action names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().map(|(n, _)| n.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// No registrations.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Outcome of dispatching one action.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Apply these ops in order.
    Ops(Vec<HubOp>),
    /// Write these bytes to the focused session.
    Forward(Vec<u8>),
    /// Nothing handles this action in the current mode.
    Ignored,
}

/// Resolves and runs the handler for `action`.
pub fn dispatch(registry: &ActionRegistry, ctx: &ActionContext, action: &Action) -> Result<Dispatch> {
    if let Some(handler) = registry.resolve(&action.name, ctx.mode) {
        return handler(ctx, action).map(Dispatch::Ops);
    }
    match &action.raw_input {
        Some(raw) if ctx.mode.is_interactive() => Ok(Dispatch::Forward(raw.clone())),
        _ => {
            log::debug!("No handler for action '{}' in mode {}", action.name, ctx.mode);
            Ok(Dispatch::Ignored)
        }
    }
}
