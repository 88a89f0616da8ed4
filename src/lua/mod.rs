//! Lua extension modules.
//!
//! Every `.lua` file under the modules directory is one hot-reloadable
//! module, named by its path in dot notation. Files under `agent/` run in
//! the `agent` tier; everything else runs as `user`.
//!
//! ```text
//! ~/.agent_hub/modules/
//!   notify_slack.lua        -> "notify_slack"   (user)
//!   lib/format.lua          -> "lib.format"     (user)
//!   agent/review_rules.lua  -> "agent.review_rules" (agent, sandboxed)
//! ```
//!
//! # Architecture
//!
//! ```text
//! Hub
//!  ├── ModuleRegistry ── LuaModule (one Lua state per module)
//!  │                        └── primitives: log, fs, hooks, actions, modules, hub
//!  └── ModuleWatcher ──(ModulesChanged)──> Hub::modules_changed
//! ```

pub mod file_watcher;
pub mod module;
pub mod primitives;

pub use file_watcher::{path_to_module, ModuleWatcher};
pub use module::LuaModule;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::hooks::HookRegistry;
use crate::hub::actions::ActionRegistry;
use crate::hub::hub_handle::HubHandle;
use crate::modules::{Module, ModuleError, ModuleKind, ModuleRegistry};
use crate::sandbox::TrustTier;

/// Directory (and name prefix) for agent-tier modules.
pub const AGENT_MODULE_PREFIX: &str = "agent";

/// Tier a module runs in, derived from its name.
pub fn tier_for(name: &str) -> TrustTier {
    match name.split_once('.') {
        Some((AGENT_MODULE_PREFIX, _)) => TrustTier::Agent,
        _ => TrustTier::User,
    }
}

/// Script path of module `name` under `dir`.
pub fn module_path(dir: &Path, name: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for part in name.split('.') {
        path.push(part);
    }
    path.set_extension("lua");
    path
}

/// All `.lua` files under `dir` as `(name, path)`, sorted by name.
///
/// A missing directory yields an empty list.
pub fn discover(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("Failed to read {}", current.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Some(name) = path_to_module(dir, &path) {
                found.push((name, path));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Registers the script for `name` as a reloadable module.
pub fn register_script(
    modules: &mut ModuleRegistry,
    hooks: &mut HookRegistry,
    actions: &mut ActionRegistry,
    name: &str,
    path: PathBuf,
    hub: Option<HubHandle>,
) -> Result<(), ModuleError> {
    let module_name = name.to_string();
    modules.register(
        name,
        ModuleKind::Reloadable,
        tier_for(name),
        Box::new(move || {
            Ok(Box::new(LuaModule::new(module_name.clone(), path.clone(), hub.clone())) as Box<dyn Module>)
        }),
        hooks,
        actions,
    )
}

/// Loads every script in `dir`. Failures are logged; the rest still load.
///
/// Returns the number of modules loaded.
pub fn load_dir(
    dir: &Path,
    modules: &mut ModuleRegistry,
    hooks: &mut HookRegistry,
    actions: &mut ActionRegistry,
    hub: Option<&HubHandle>,
) -> Result<usize> {
    let mut loaded = 0;
    for (name, path) in discover(dir)? {
        match register_script(modules, hooks, actions, &name, path, hub.cloned()) {
            Ok(()) => loaded += 1,
            Err(e) => log::warn!("[Modules] Skipping {name}: {e}"),
        }
    }
    Ok(loaded)
}

/// Applies file changes reported by the watcher.
///
/// Known modules are reloaded (or unloaded if their file is gone); new
/// files are registered.
pub fn apply_changes(
    dir: &Path,
    changed: &[String],
    modules: &mut ModuleRegistry,
    hooks: &mut HookRegistry,
    actions: &mut ActionRegistry,
    hub: Option<&HubHandle>,
) {
    for name in changed {
        let path = module_path(dir, name);
        let result = match (modules.contains(name), path.is_file()) {
            (true, true) => modules.reload(name, hooks, actions),
            (true, false) => modules.unload(name, hooks, actions),
            (false, true) => register_script(modules, hooks, actions, name, path, hub.cloned()),
            (false, false) => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("[Modules] Change to {name} not applied: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_from_name() {
        assert_eq!(tier_for("agent.rules"), TrustTier::Agent);
        assert_eq!(tier_for("agent_tools"), TrustTier::User);
        assert_eq!(tier_for("agent"), TrustTier::User);
        assert_eq!(tier_for("lib.agent"), TrustTier::User);
    }

    #[test]
    fn test_module_path_round_trip() {
        let dir = Path::new("/mods");
        let path = module_path(dir, "agent.rules");
        assert_eq!(path, PathBuf::from("/mods/agent/rules.lua"));
        assert_eq!(path_to_module(dir, &path).as_deref(), Some("agent.rules"));
    }

    #[test]
    fn test_discover_and_apply_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("agent")).unwrap();
        std::fs::write(dir.path().join("a.lua"), r#"hooks.on("agent_created", "a", function() end)"#).unwrap();
        std::fs::write(dir.path().join("agent/b.lua"), r#"hooks.on("agent_deleted", "b", function() end)"#).unwrap();
        std::fs::write(dir.path().join("broken.lua"), "???").unwrap();

        let names: Vec<String> = discover(dir.path()).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "agent.b", "broken"]);

        let mut modules = ModuleRegistry::new(None);
        let mut hooks = HookRegistry::default();
        let mut actions = ActionRegistry::default();
        let loaded = load_dir(dir.path(), &mut modules, &mut hooks, &mut actions, None).unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(modules.tier("agent.b"), Some(TrustTier::Agent));

        std::fs::remove_file(dir.path().join("a.lua")).unwrap();
        std::fs::write(dir.path().join("broken.lua"), r#"hooks.on("shutdown", "c", function() end)"#).unwrap();
        apply_changes(
            dir.path(),
            &["a".to_string(), "broken".to_string()],
            &mut modules,
            &mut hooks,
            &mut actions,
            None,
        );
        assert!(!modules.contains("a"));
        assert!(modules.contains("broken"));
        assert!(!hooks.has_observers("agent_created"));
        assert!(hooks.has_observers("shutdown"));
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        assert!(discover(Path::new("/nonexistent/agent-hub")).unwrap().is_empty());
    }
}
