//! A `.lua` file running as a hub [`Module`].
//!
//! Every instance owns a fresh Lua state, built when `load` runs so the
//! state matches the capabilities the registry assigned:
//!
//! - `core` / `user`: safe standard libraries, primitives in globals.
//! - `agent`: only `string`, `table`, `math` and `utf8` are opened, the
//!   state gets a memory cap, and the chunk runs in an environment table
//!   holding a whitelist of base functions plus the reduced primitives.
//!   `require`, `load`, `dofile`, `io`, `os`, `debug` and `package` do not
//!   exist there.
//!
//! Optional top-level `before_reload()` / `after_reload()` functions in the
//! script are called around a hot reload.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use mlua::{
    Function, Lua, LuaOptions, LuaSerdeExt, RegistryKey, StdLib, Table, Value as LuaValue,
};
use serde_json::Value;

use super::primitives::{self, Pending, PendingQueue};
use crate::constants::AGENT_TIER_MEMORY_LIMIT;
use crate::hooks::{HookOptions, InterceptorFn, ObserverFn};
use crate::hub::actions::{Action, ActionContext, ActionHandler};
use crate::hub::hub_handle::HubHandle;
use crate::hub::ops::HubOp;
use crate::modules::{Module, ModuleContext};
use crate::sandbox::TrustTier;

/// Base functions visible to `agent` tier scripts.
const AGENT_GLOBALS: &[&str] = &[
    "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber", "tostring",
    "type", "xpcall", "string", "table", "math", "utf8",
];

/// Convert JSON to a Lua value. Object entries holding `null` are omitted.
pub fn json_to_lua(lua: &Lua, v: &Value) -> mlua::Result<LuaValue> {
    match v {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(LuaValue::Number(f))
            } else {
                Ok(LuaValue::Nil)
            }
        }
        Value::String(s) => lua.create_string(s).map(LuaValue::String),
        Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, item) in arr.iter().enumerate() {
                table.set(i + 1, json_to_lua(lua, item)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (key, val) in map {
                if !val.is_null() {
                    table.set(lua.create_string(key)?, json_to_lua(lua, val)?)?;
                }
            }
            Ok(LuaValue::Table(table))
        }
    }
}

fn lua_to_json(lua: &Lua, v: LuaValue) -> Result<Value> {
    lua.from_value(v).map_err(|e| anyhow!("Lua value is not JSON-compatible: {e}"))
}

/// Interpret a Lua action handler's return value as ops.
///
/// `nil` or an empty table means no ops, a table with an `op` field is one
/// op, and an array is a list of ops.
pub fn ops_from_json(value: Value) -> Result<Vec<HubOp>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).context("Invalid op returned by handler"))
            .collect(),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        Value::Object(map) if map.contains_key("op") => {
            let op = serde_json::from_value(Value::Object(map))
                .context("Invalid op returned by handler")?;
            Ok(vec![op])
        }
        other => bail!("Action handler must return an op, a list of ops or nil, got {other}"),
    }
}

/// Hub module backed by a Lua script.
pub struct LuaModule {
    name: String,
    path: PathBuf,
    hub: Option<HubHandle>,
    lua: Option<Lua>,
    env: Option<Table>,
    queue: PendingQueue,
}

impl std::fmt::Debug for LuaModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("loaded", &self.lua.is_some())
            .finish_non_exhaustive()
    }
}

impl LuaModule {
    /// Module `name` backed by the script at `path`. Nothing runs until `load`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, hub: Option<HubHandle>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            hub,
            lua: None,
            env: None,
            queue: primitives::new_pending_queue(),
        }
    }

    /// Script path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn build_state(&self, ctx: &ModuleContext<'_>) -> Result<(Lua, Table)> {
        let caps = ctx.capabilities();
        let (lua, env) = if caps.tier == TrustTier::Agent {
            let lua = Lua::new_with(
                StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
                LuaOptions::default(),
            )
            .map_err(|e| anyhow!("Failed to create Lua state: {e}"))?;
            lua.set_memory_limit(AGENT_TIER_MEMORY_LIMIT)
                .map_err(|e| anyhow!("Failed to set memory limit: {e}"))?;

            let globals = lua.globals();
            let env = lua
                .create_table()
                .map_err(|e| anyhow!("Failed to create environment: {e}"))?;
            for name in AGENT_GLOBALS {
                let value: LuaValue = globals
                    .get(*name)
                    .map_err(|e| anyhow!("Failed to read global {name}: {e}"))?;
                env.set(*name, value)
                    .map_err(|e| anyhow!("Failed to copy global {name}: {e}"))?;
            }
            env.set("_G", env.clone())
                .map_err(|e| anyhow!("Failed to set _G: {e}"))?;
            (lua, env)
        } else {
            let lua = Lua::new();
            let env = lua.globals();
            (lua, env)
        };

        let hub = if caps.tier.is_trusted() { self.hub.as_ref() } else { None };
        primitives::register_all(&lua, &env, &self.name, caps, &self.queue, hub)?;
        Ok((lua, env))
    }

    /// Applies queued registrations to the hub registries.
    ///
    /// Stops at the first refused registration and returns its error; the
    /// remaining entries are discarded.
    fn flush(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        let Some(lua) = self.lua.clone() else {
            return Ok(());
        };
        let pending: Vec<Pending> = self.queue.borrow_mut().drain(..).collect();
        for entry in pending {
            match entry {
                Pending::On { event, name, key, opts } => {
                    let label = format!("{}:{event}:{name}", self.name);
                    ctx.on(
                        &event,
                        &name,
                        observer(&lua, key, label),
                        hook_options(opts.priority, opts.disabled, opts.timeout_ms),
                    );
                }
                Pending::Intercept { event, name, key, opts } => {
                    let label = format!("{}:{event}:{name}", self.name);
                    ctx.intercept(
                        &event,
                        &name,
                        interceptor(&lua, key, label),
                        hook_options(opts.priority, opts.disabled, opts.timeout_ms),
                    )?;
                }
                Pending::Off { event, name } => {
                    if !ctx.off(&event, &name) {
                        log::debug!("[{}] hooks.off({event}, {name}) matched nothing", self.name);
                    }
                }
                Pending::Action { name, mode, key } => {
                    let label = format!("{}:{name}", self.name);
                    ctx.register_action(&name, mode, action_handler(&lua, key, label))?;
                }
                Pending::Reload { name } => ctx.request_reload(&name)?,
            }
        }
        Ok(())
    }

    fn call_optional(&self, function: &str) -> Result<()> {
        let Some(env) = &self.env else {
            return Ok(());
        };
        let f: Option<Function> = env
            .get(function)
            .map_err(|e| anyhow!("{}: failed to read {function}: {e}", self.name))?;
        if let Some(f) = f {
            f.call::<()>(())
                .map_err(|e| anyhow!("{}: {function} failed: {e}", self.name))?;
        }
        Ok(())
    }
}

fn hook_options(priority: i32, disabled: bool, timeout_ms: Option<u64>) -> HookOptions {
    let mut opts = HookOptions::priority(priority);
    opts.disabled = disabled;
    if let Some(ms) = timeout_ms {
        opts = opts.with_timeout(std::time::Duration::from_millis(ms));
    }
    opts
}

fn observer(lua: &Lua, key: RegistryKey, label: String) -> ObserverFn {
    let lua = lua.clone();
    Rc::new(move |payload: &Value| {
        let f: Function = lua
            .registry_value(&key)
            .map_err(|e| anyhow!("{label}: {e}"))?;
        let arg = json_to_lua(&lua, payload).map_err(|e| anyhow!("{label}: {e}"))?;
        f.call::<()>(arg).map_err(|e| anyhow!("{label}: {e}"))
    })
}

fn interceptor(lua: &Lua, key: RegistryKey, label: String) -> InterceptorFn {
    let lua = lua.clone();
    Rc::new(move |input: Value| {
        let f: Function = lua
            .registry_value(&key)
            .map_err(|e| anyhow!("{label}: {e}"))?;
        let arg = json_to_lua(&lua, &input).map_err(|e| anyhow!("{label}: {e}"))?;
        let out: LuaValue = f.call(arg).map_err(|e| anyhow!("{label}: {e}"))?;
        if out.is_nil() {
            return Ok(None);
        }
        lua_to_json(&lua, out).map(Some)
    })
}

fn action_handler(lua: &Lua, key: RegistryKey, label: String) -> ActionHandler {
    let lua = lua.clone();
    Rc::new(move |ctx: &ActionContext, action: &Action| {
        let f: Function = lua
            .registry_value(&key)
            .map_err(|e| anyhow!("{label}: {e}"))?;
        let ctx_json = serde_json::to_value(ctx)?;
        let ctx_arg = json_to_lua(&lua, &ctx_json).map_err(|e| anyhow!("{label}: {e}"))?;
        let payload = json_to_lua(&lua, &action.payload).map_err(|e| anyhow!("{label}: {e}"))?;
        let out: LuaValue = f
            .call((ctx_arg, payload))
            .map_err(|e| anyhow!("{label}: {e}"))?;
        if out.is_nil() {
            return Ok(Vec::new());
        }
        ops_from_json(lua_to_json(&lua, out)?)
    })
}

impl Module for LuaModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        let source = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let (lua, env) = self.build_state(ctx)?;

        let chunk = lua.load(source.as_str()).set_name(format!("@{}", self.path.display()));
        let chunk = if ctx.capabilities().tier.is_trusted() {
            chunk
        } else {
            chunk.set_environment(env.clone())
        };
        chunk
            .exec()
            .map_err(|e| anyhow!("Failed to execute {}: {e}", self.path.display()))?;

        self.lua = Some(lua);
        self.env = Some(env);
        self.flush(ctx)
    }

    fn before_reload(&mut self) -> Result<()> {
        self.call_optional("before_reload")
    }

    fn after_reload(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        self.call_optional("after_reload")?;
        self.flush(ctx)
    }

    fn poll(&mut self, ctx: &mut ModuleContext<'_>) {
        if let Err(e) = self.flush(ctx) {
            log::warn!("[{}] Registration from callback refused: {e:#}", self.name);
        }
    }
}
