//! Extension modules and hot reload.
//!
//! A module is a named unit of extension code implementing [`Module`]. The
//! registry keeps one live instance per name plus the factory that built it,
//! so "reload" means: tell the old instance it is going away, build a fresh
//! one behind the same name and let it register again.
//!
//! ```text
//! reload(name)
//!   protected?          -> ModuleError::Protected
//!   old.before_reload()
//!   take old hook/action registrations
//!   new = factory(); new.load(ctx)
//!     ok  -> drop old registrations and instance, new.after_reload(ctx)
//!     err -> clear partial registrations, restore old ones,
//!            old.after_reload(ctx), ModuleError::LoadFailed
//! ```
//!
//! Everything a module registers is tagged with its name as owner, which is
//! how the registry finds what to clear on reload.

pub mod builtin;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;

use crate::hooks::{HookOptions, HookRegistry, InterceptorFn, ObserverFn};
use crate::hub::actions::{ActionHandler, ActionRegistry};
use crate::hub::state::UiMode;
use crate::sandbox::{Capabilities, Capability, TrustTier};

/// Whether a module may be hot-reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Core module, loaded once.
    Protected,
    /// Can be reloaded at runtime.
    Reloadable,
}

/// Module registry failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModuleError {
    /// Reload or unload of a protected module.
    #[error("module '{0}' is protected and cannot be reloaded")]
    Protected(String),
    /// No module with that name.
    #[error("unknown module '{0}'")]
    Unknown(String),
    /// A module with that name is already registered.
    #[error("module '{0}' is already loaded")]
    AlreadyLoaded(String),
    /// Construction or `load` failed.
    #[error("module '{name}' failed to load: {reason}")]
    LoadFailed {
        /// Module name.
        name: String,
        /// Formatted error chain.
        reason: String,
    },
}

/// Names queued for reload by modules holding [`Capability::Reload`].
pub type ReloadQueue = Rc<RefCell<VecDeque<String>>>;

/// Registration surface handed to a module while it loads.
///
/// Every registration made through it is owned by the module.
pub struct ModuleContext<'a> {
    hooks: &'a mut HookRegistry,
    actions: &'a mut ActionRegistry,
    capabilities: &'a Capabilities,
    owner: &'a str,
    reload_queue: &'a ReloadQueue,
}

impl<'a> ModuleContext<'a> {
    /// Module name all registrations are attributed to.
    pub fn owner(&self) -> &str {
        self.owner
    }

    /// Capabilities of the module.
    pub fn capabilities(&self) -> &Capabilities {
        self.capabilities
    }

    /// Registers an observer.
    pub fn on(&mut self, event: &str, name: &str, callback: ObserverFn, opts: HookOptions) {
        self.hooks
            .on(event, name, callback, opts.owned_by(self.owner));
    }

    /// Registers an interceptor. Needs [`Capability::Intercept`].
    pub fn intercept(
        &mut self,
        event: &str,
        name: &str,
        callback: InterceptorFn,
        opts: HookOptions,
    ) -> Result<()> {
        self.capabilities.require(Capability::Intercept)?;
        self.hooks
            .intercept(event, name, callback, opts.owned_by(self.owner));
        Ok(())
    }

    /// Removes one of this module's own hook registrations.
    pub fn off(&mut self, event: &str, name: &str) -> bool {
        if self.hooks.owner_of(event, name) != Some(self.owner) {
            return false;
        }
        self.hooks.off(event, name)
    }

    /// Registers an action handler. Needs [`Capability::RegisterActions`].
    pub fn register_action(
        &mut self,
        name: &str,
        mode: Option<UiMode>,
        handler: ActionHandler,
    ) -> Result<()> {
        self.capabilities.require(Capability::RegisterActions)?;
        self.actions
            .register(name, mode, handler, Some(self.owner.to_string()));
        Ok(())
    }

    /// Queues a reload of `name`. Needs [`Capability::Reload`].
    pub fn request_reload(&mut self, name: &str) -> Result<()> {
        self.capabilities.require(Capability::Reload)?;
        self.reload_queue.borrow_mut().push_back(name.to_string());
        Ok(())
    }
}

/// A unit of extension code.
pub trait Module {
    /// Registry key.
    fn name(&self) -> &str;

    /// Registers hooks and actions.
    fn load(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()>;

    /// Called on the old instance before a reload; release timers and the like.
    fn before_reload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called on whichever instance is live once a reload attempt finishes.
    fn after_reload(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called every Hub tick; lets a module flush registrations made
    /// from inside its callbacks.
    fn poll(&mut self, _ctx: &mut ModuleContext<'_>) {}
}

/// Builds a fresh module instance.
pub type ModuleFactory = Box<dyn Fn() -> Result<Box<dyn Module>>>;

struct ModuleEntry {
    kind: ModuleKind,
    capabilities: Capabilities,
    factory: ModuleFactory,
    instance: Box<dyn Module>,
}

/// Live modules keyed by name.
pub struct ModuleRegistry {
    entries: BTreeMap<String, ModuleEntry>,
    agent_scope: Option<PathBuf>,
    reload_queue: ReloadQueue,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.entries.keys().collect::<Vec<_>>())
            .field("agent_scope", &self.agent_scope)
            .finish_non_exhaustive()
    }
}

impl ModuleRegistry {
    /// Empty registry. `agent_scope` is the directory `agent` tier modules may read.
    pub fn new(agent_scope: Option<PathBuf>) -> Self {
        Self {
            entries: BTreeMap::new(),
            agent_scope,
            reload_queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Builds, loads and registers a module.
    ///
    /// Partial registrations of a module whose `load` fails are cleared.
    pub fn register(
        &mut self,
        name: &str,
        kind: ModuleKind,
        tier: TrustTier,
        factory: ModuleFactory,
        hooks: &mut HookRegistry,
        actions: &mut ActionRegistry,
    ) -> Result<(), ModuleError> {
        if self.entries.contains_key(name) {
            return Err(ModuleError::AlreadyLoaded(name.to_string()));
        }
        let capabilities = Capabilities::for_tier(tier, self.agent_scope.as_deref())
            .map_err(|e| load_failed(name, &anyhow::Error::from(e)))?;

        let mut instance = factory().map_err(|e| load_failed(name, &e))?;
        let loaded = {
            let mut ctx = ModuleContext {
                hooks: &mut *hooks,
                actions: &mut *actions,
                capabilities: &capabilities,
                owner: name,
                reload_queue: &self.reload_queue,
            };
            instance.load(&mut ctx)
        };
        if let Err(e) = loaded {
            hooks.clear_owner(name);
            actions.clear_owner(name);
            log::error!("[Modules] Failed to load {name}: {e:#}");
            return Err(load_failed(name, &e));
        }

        log::info!("[Modules] Loaded {name} ({tier}, {kind:?})");
        self.entries.insert(
            name.to_string(),
            ModuleEntry {
                kind,
                capabilities,
                factory,
                instance,
            },
        );
        Ok(())
    }

    /// Replaces the live instance of `name` with a freshly built one.
    ///
    /// On failure the previous instance and its registrations stay in place
    /// and the error is returned.
    pub fn reload(
        &mut self,
        name: &str,
        hooks: &mut HookRegistry,
        actions: &mut ActionRegistry,
    ) -> Result<(), ModuleError> {
        let reload_queue = self.reload_queue.clone();
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ModuleError::Unknown(name.to_string()))?;
        if entry.kind == ModuleKind::Protected {
            log::warn!("[Modules] Refusing to reload protected module {name}");
            return Err(ModuleError::Protected(name.to_string()));
        }

        if let Err(e) = entry.instance.before_reload() {
            log::warn!("[Modules] {name} before_reload failed: {e:#}");
        }
        let saved_hooks = hooks.take_owned(name);
        let saved_actions = actions.take_owned(name);

        let attempt = (entry.factory)().and_then(|mut fresh| {
            let mut ctx = ModuleContext {
                hooks: &mut *hooks,
                actions: &mut *actions,
                capabilities: &entry.capabilities,
                owner: name,
                reload_queue: &reload_queue,
            };
            fresh.load(&mut ctx).map(|()| fresh)
        });

        let result = match attempt {
            Ok(fresh) => {
                drop(saved_hooks);
                drop(saved_actions);
                entry.instance = fresh;
                log::info!("[Modules] Reloaded {name}");
                Ok(())
            }
            Err(e) => {
                hooks.clear_owner(name);
                actions.clear_owner(name);
                hooks.restore(saved_hooks);
                actions.restore(saved_actions);
                log::error!("[Modules] Reload of {name} failed, keeping previous instance: {e:#}");
                Err(load_failed(name, &e))
            }
        };

        let mut ctx = ModuleContext {
            hooks,
            actions,
            capabilities: &entry.capabilities,
            owner: name,
            reload_queue: &reload_queue,
        };
        if let Err(e) = entry.instance.after_reload(&mut ctx) {
            log::warn!("[Modules] {name} after_reload failed: {e:#}");
        }
        result
    }

    /// Removes a reloadable module and everything it registered.
    pub fn unload(
        &mut self,
        name: &str,
        hooks: &mut HookRegistry,
        actions: &mut ActionRegistry,
    ) -> Result<(), ModuleError> {
        match self.entries.get(name).map(|e| e.kind) {
            None => return Err(ModuleError::Unknown(name.to_string())),
            Some(ModuleKind::Protected) => return Err(ModuleError::Protected(name.to_string())),
            Some(ModuleKind::Reloadable) => {}
        }
        if let Some(mut entry) = self.entries.remove(name) {
            if let Err(e) = entry.instance.before_reload() {
                log::warn!("[Modules] {name} before_reload failed during unload: {e:#}");
            }
        }
        hooks.clear_owner(name);
        actions.clear_owner(name);
        log::info!("[Modules] Unloaded {name}");
        Ok(())
    }

    /// Runs queued reload requests and each module's `poll`.
    pub fn tick(&mut self, hooks: &mut HookRegistry, actions: &mut ActionRegistry) {
        let queued: Vec<String> = self.reload_queue.borrow_mut().drain(..).collect();
        for name in queued {
            if let Err(e) = self.reload(&name, hooks, actions) {
                log::warn!("[Modules] Requested reload of {name} failed: {e}");
            }
        }

        let reload_queue = self.reload_queue.clone();
        for (name, entry) in &mut self.entries {
            let mut ctx = ModuleContext {
                hooks: &mut *hooks,
                actions: &mut *actions,
                capabilities: &entry.capabilities,
                owner: name,
                reload_queue: &reload_queue,
            };
            entry.instance.poll(&mut ctx);
        }
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Kind of `name`, if registered.
    pub fn kind(&self, name: &str) -> Option<ModuleKind> {
        self.entries.get(name).map(|e| e.kind)
    }

    /// Tier of `name`, if registered.
    pub fn tier(&self, name: &str) -> Option<TrustTier> {
        self.entries.get(name).map(|e| e.capabilities.tier)
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No modules.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn load_failed(name: &str, err: &anyhow::Error) -> ModuleError {
    ModuleError::LoadFailed {
        name: name.to_string(),
        reason: format!("{err:#}"),
    }
}
