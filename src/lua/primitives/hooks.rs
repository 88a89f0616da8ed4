//! Hook, action and reload registration for Lua modules.
//!
//! Lua functions never touch the Hub registries directly. Each call records
//! a [`Pending`] entry holding the function in the Lua registry; the owning
//! `LuaModule` drains the queue into its `ModuleContext` during `load` and
//! on every Hub tick, so registrations made from inside callbacks land on
//! the next tick.
//!
//! # Usage in Lua
//!
//! ```lua
//! hooks.on("agent_created", "announce", function(agent)
//!     log.info("created " .. agent.key)
//! end, { priority = 10 })
//!
//! -- core/user only
//! hooks.intercept("before_agent_create", "default_profile", function(req)
//!     req.profile = req.profile or "claude"
//!     return req          -- nil drops the request
//! end, { timeout_ms = 50 })
//!
//! actions.register("focus_first", function(ctx, payload)
//!     return { op = "focus", agent_key = ctx.agents[1].key }
//! end)
//!
//! modules.reload("other_module")
//! hub.submit("refresh_worktrees", {})
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, LuaSerdeExt, RegistryKey, Table, Value as LuaValue};
use serde_json::Value;

use crate::client::ClientId;
use crate::hub::actions::Action;
use crate::hub::hub_handle::HubHandle;
use crate::hub::state::UiMode;
use crate::sandbox::{Capabilities, Capability};

/// Options accepted as the last argument of `hooks.on` / `hooks.intercept`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LuaHookOpts {
    /// Higher runs first.
    pub priority: i32,
    /// Register disabled.
    pub disabled: bool,
    /// Interceptor budget in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// A registration requested from Lua, waiting to be applied.
#[derive(Debug)]
pub enum Pending {
    /// `hooks.on`.
    On {
        /// Event name.
        event: String,
        /// Registration name.
        name: String,
        /// Callback in the Lua registry.
        key: RegistryKey,
        /// Options.
        opts: LuaHookOpts,
    },
    /// `hooks.intercept`.
    Intercept {
        /// Event name.
        event: String,
        /// Registration name.
        name: String,
        /// Callback in the Lua registry.
        key: RegistryKey,
        /// Options.
        opts: LuaHookOpts,
    },
    /// `hooks.off`.
    Off {
        /// Event name.
        event: String,
        /// Registration name.
        name: String,
    },
    /// `actions.register`.
    Action {
        /// Action name.
        name: String,
        /// Mode the handler is bound to, if any.
        mode: Option<UiMode>,
        /// Handler in the Lua registry.
        key: RegistryKey,
    },
    /// `modules.reload`.
    Reload {
        /// Module to reload.
        name: String,
    },
}

/// Shared queue of pending registrations.
pub type PendingQueue = Rc<RefCell<Vec<Pending>>>;

/// Creates an empty queue.
pub fn new_pending_queue() -> PendingQueue {
    Rc::new(RefCell::new(Vec::new()))
}

fn parse_opts(opts: Option<Table>) -> mlua::Result<LuaHookOpts> {
    let Some(opts) = opts else {
        return Ok(LuaHookOpts::default());
    };
    Ok(LuaHookOpts {
        priority: opts.get::<Option<i32>>("priority")?.unwrap_or(0),
        disabled: opts.get::<Option<bool>>("disabled")?.unwrap_or(false),
        timeout_ms: opts.get::<Option<u64>>("timeout_ms")?,
    })
}

fn denied(lua: &Lua, caps: &Capabilities, capability: Capability) -> Result<Function> {
    let message = caps
        .require(capability)
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    lua.create_function(move |_, _: mlua::MultiValue| -> mlua::Result<()> {
        Err(mlua::Error::runtime(message.clone()))
    })
    .map_err(|e| anyhow!("Failed to create denial stub: {e}"))
}

/// Register `hooks` (and for trusted tiers `actions`, `modules`, `hub`) into `env`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(
    lua: &Lua,
    env: &Table,
    caps: &Capabilities,
    queue: &PendingQueue,
    hub: Option<&HubHandle>,
) -> Result<()> {
    let hooks = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create hooks table: {e}"))?;

    let q = queue.clone();
    let on_fn = lua
        .create_function(
            move |lua, (event, name, f, opts): (String, String, Function, Option<Table>)| {
                let opts = parse_opts(opts)?;
                let key = lua.create_registry_value(f)?;
                q.borrow_mut().push(Pending::On { event, name, key, opts });
                Ok(())
            },
        )
        .map_err(|e| anyhow!("Failed to create hooks.on: {e}"))?;
    hooks
        .set("on", on_fn)
        .map_err(|e| anyhow!("Failed to set hooks.on: {e}"))?;

    let q = queue.clone();
    let off_fn = lua
        .create_function(move |_, (event, name): (String, String)| {
            q.borrow_mut().push(Pending::Off { event, name });
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create hooks.off: {e}"))?;
    hooks
        .set("off", off_fn)
        .map_err(|e| anyhow!("Failed to set hooks.off: {e}"))?;

    let intercept_fn = if caps.allows(Capability::Intercept) {
        let q = queue.clone();
        lua.create_function(
            move |lua, (event, name, f, opts): (String, String, Function, Option<Table>)| {
                let opts = parse_opts(opts)?;
                let key = lua.create_registry_value(f)?;
                q.borrow_mut()
                    .push(Pending::Intercept { event, name, key, opts });
                Ok(())
            },
        )
        .map_err(|e| anyhow!("Failed to create hooks.intercept: {e}"))?
    } else {
        denied(lua, caps, Capability::Intercept)?
    };
    hooks
        .set("intercept", intercept_fn)
        .map_err(|e| anyhow!("Failed to set hooks.intercept: {e}"))?;

    env.set("hooks", hooks)
        .map_err(|e| anyhow!("Failed to register hooks table: {e}"))?;

    if !caps.tier.is_trusted() {
        return Ok(());
    }

    if caps.allows(Capability::RegisterActions) {
        let actions = lua
            .create_table()
            .map_err(|e| anyhow!("Failed to create actions table: {e}"))?;
        let q = queue.clone();
        let register_fn = lua
            .create_function(
                move |lua, (name, f, mode): (String, Function, Option<String>)| {
                    let mode = mode
                        .map(|m| m.parse::<UiMode>())
                        .transpose()
                        .map_err(|e| mlua::Error::runtime(e.to_string()))?;
                    let key = lua.create_registry_value(f)?;
                    q.borrow_mut().push(Pending::Action { name, mode, key });
                    Ok(())
                },
            )
            .map_err(|e| anyhow!("Failed to create actions.register: {e}"))?;
        actions
            .set("register", register_fn)
            .map_err(|e| anyhow!("Failed to set actions.register: {e}"))?;
        env.set("actions", actions)
            .map_err(|e| anyhow!("Failed to register actions table: {e}"))?;
    }

    if caps.allows(Capability::Reload) {
        let modules = lua
            .create_table()
            .map_err(|e| anyhow!("Failed to create modules table: {e}"))?;
        let q = queue.clone();
        let reload_fn = lua
            .create_function(move |_, name: String| {
                q.borrow_mut().push(Pending::Reload { name });
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create modules.reload: {e}"))?;
        modules
            .set("reload", reload_fn)
            .map_err(|e| anyhow!("Failed to set modules.reload: {e}"))?;
        env.set("modules", modules)
            .map_err(|e| anyhow!("Failed to register modules table: {e}"))?;
    }

    if let Some(hub) = hub {
        let hub_table = lua
            .create_table()
            .map_err(|e| anyhow!("Failed to create hub table: {e}"))?;
        let handle = hub.clone();
        let submit_fn = lua
            .create_function(move |lua, (name, payload): (String, Option<LuaValue>)| {
                let payload: Value = match payload {
                    Some(v) => lua.from_value(v)?,
                    None => Value::Null,
                };
                let action = Action::new(name, payload).from_client(ClientId::Internal);
                match handle.submit(action) {
                    Ok(()) => Ok((true, None::<String>)),
                    Err(e) => Ok((false, Some(e.to_string()))),
                }
            })
            .map_err(|e| anyhow!("Failed to create hub.submit: {e}"))?;
        hub_table
            .set("submit", submit_fn)
            .map_err(|e| anyhow!("Failed to set hub.submit: {e}"))?;
        env.set("hub", hub_table)
            .map_err(|e| anyhow!("Failed to register hub table: {e}"))?;
    }

    Ok(())
}
