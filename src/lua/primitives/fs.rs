//! File system primitives for Lua modules.
//!
//! Every call goes through the module's [`FsCapability`]: host paths for
//! trusted tiers, a read-only directory view for the `agent` tier.
//!
//! # Usage in Lua
//!
//! ```lua
//! local content, err = fs.read("notes.md")
//! if not content then
//!     log.warn("read failed: " .. err)
//! end
//!
//! local ok, err = fs.write("/tmp/out.txt", "hello")
//! if fs.exists("prompts") then
//!     for _, name in ipairs(fs.list("prompts")) do log.info(name) end
//! end
//! ```
//!
//! # Error Handling
//!
//! Functions that can fail return two values following Lua convention:
//! - Success: `value, nil`
//! - Failure: `nil, error_message`

use anyhow::{anyhow, Result};
use mlua::{Lua, Table};

use crate::sandbox::FsCapability;

/// Register the `fs` table into `env`.
///
/// # Errors
///
/// Returns an error if Lua table or function creation fails.
pub fn register(lua: &Lua, env: &Table, cap: FsCapability) -> Result<()> {
    let fs_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create fs table: {e}"))?;

    let read_cap = cap.clone();
    let read_fn = lua
        .create_function(move |_, path: String| match read_cap.read_to_string(&path) {
            Ok(content) => Ok((Some(content), None::<String>)),
            Err(e) => Ok((None::<String>, Some(e.to_string()))),
        })
        .map_err(|e| anyhow!("Failed to create fs.read function: {e}"))?;
    fs_table
        .set("read", read_fn)
        .map_err(|e| anyhow!("Failed to set fs.read: {e}"))?;

    let write_cap = cap.clone();
    let write_fn = lua
        .create_function(move |_, (path, content): (String, String)| {
            match write_cap.write(&path, &content) {
                Ok(()) => Ok((Some(true), None::<String>)),
                Err(e) => Ok((None::<bool>, Some(e.to_string()))),
            }
        })
        .map_err(|e| anyhow!("Failed to create fs.write function: {e}"))?;
    fs_table
        .set("write", write_fn)
        .map_err(|e| anyhow!("Failed to set fs.write: {e}"))?;

    let exists_cap = cap.clone();
    let exists_fn = lua
        .create_function(move |_, path: String| Ok(exists_cap.exists(&path)))
        .map_err(|e| anyhow!("Failed to create fs.exists function: {e}"))?;
    fs_table
        .set("exists", exists_fn)
        .map_err(|e| anyhow!("Failed to set fs.exists: {e}"))?;

    let list_fn = lua
        .create_function(move |_, path: String| match cap.list(&path) {
            Ok(names) => Ok((Some(names), None::<String>)),
            Err(e) => Ok((None::<Vec<String>>, Some(e.to_string()))),
        })
        .map_err(|e| anyhow!("Failed to create fs.list function: {e}"))?;
    fs_table
        .set("list", list_fn)
        .map_err(|e| anyhow!("Failed to set fs.list: {e}"))?;

    env.set("fs", fs_table)
        .map_err(|e| anyhow!("Failed to register fs table: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ScopedFs;

    fn lua_with(cap: FsCapability) -> Lua {
        let lua = Lua::new();
        register(&lua, &lua.globals(), cap).expect("Should register fs primitives");
        lua
    }

    #[test]
    fn test_full_write_and_read() {
        let lua = lua_with(FsCapability::Full);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/test.txt");
        let path_str = path.to_str().unwrap();

        let (ok, err): (Option<bool>, Option<String>) = lua
            .load(format!(r#"return fs.write("{path_str}", "hello world")"#))
            .eval()
            .unwrap();
        assert_eq!(ok, Some(true));
        assert!(err.is_none());

        let (content, _): (Option<String>, Option<String>) = lua
            .load(format!(r#"return fs.read("{path_str}")"#))
            .eval()
            .unwrap();
        assert_eq!(content.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_scoped_rejects_escape_and_write() {
        let scope = tempfile::tempdir().unwrap();
        std::fs::write(scope.path().join("ok.txt"), "inside").unwrap();
        let lua = lua_with(FsCapability::Scoped(ScopedFs::new(scope.path()).unwrap()));

        let (content, _): (Option<String>, Option<String>) =
            lua.load(r#"return fs.read("ok.txt")"#).eval().unwrap();
        assert_eq!(content.as_deref(), Some("inside"));

        let (content, err): (Option<String>, Option<String>) =
            lua.load(r#"return fs.read("../etc/passwd")"#).eval().unwrap();
        assert!(content.is_none());
        assert!(err.is_some());

        let (content, _): (Option<String>, Option<String>) =
            lua.load(r#"return fs.read("/etc/hostname")"#).eval().unwrap();
        assert!(content.is_none());

        let (ok, err): (Option<bool>, Option<String>) =
            lua.load(r#"return fs.write("new.txt", "x")"#).eval().unwrap();
        assert!(ok.is_none());
        assert!(err.is_some());
        assert!(!scope.path().join("new.txt").exists());
    }
}
