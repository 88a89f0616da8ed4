//! Logging primitive for Lua modules.
//!
//! # Usage in Lua
//!
//! ```lua
//! log.info("Application started")
//! log.warn("Configuration not found, using defaults")
//! log.debug("Processing item: " .. item_id)
//! ```
//!
//! Messages go through the `log` crate with target `lua` and the module
//! name as prefix, so they respect the configured filters.

use anyhow::{anyhow, Result};
use mlua::{Lua, Table};

/// Register the `log` table into `env`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua, env: &Table, module: &str) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    for level in [::log::Level::Info, ::log::Level::Warn, ::log::Level::Error, ::log::Level::Debug] {
        let prefix = module.to_string();
        let f = lua
            .create_function(move |_, msg: String| {
                ::log::log!(target: "lua", level, "[{prefix}] {msg}");
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log function: {e}"))?;
        log_table
            .set(level.as_str().to_lowercase(), f)
            .map_err(|e| anyhow!("Failed to set log.{level}: {e}"))?;
    }

    env.set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Function;

    #[test]
    fn test_log_functions_callable() {
        let lua = Lua::new();
        register(&lua, &lua.globals(), "test").expect("Should register log primitives");

        let log_table: Table = lua.globals().get("log").expect("log table should exist");
        for name in ["info", "warn", "error", "debug"] {
            let _: Function = log_table.get(name).expect("log function should exist");
        }
        lua.load(r#"log.info("hi"); log.warn("w"); log.error("e"); log.debug("d")"#)
            .exec()
            .expect("log functions should be callable");
    }
}
