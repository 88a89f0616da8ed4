//! Lua primitive functions exposed to modules.
//!
//! Primitives are registered into a module's environment table, not into
//! shared globals, so each module only sees what its tier's
//! [`Capabilities`] allow.
//!
//! # Available Primitives
//!
//! | Table     | core/user                          | agent                 |
//! |-----------|------------------------------------|-----------------------|
//! | `log`     | info, warn, error, debug           | same                  |
//! | `fs`      | read, write, exists, list (host)   | read, exists, list in scope; write fails |
//! | `hooks`   | on, intercept, off                 | on, off               |
//! | `actions` | register                           | absent                |
//! | `modules` | reload                             | absent                |
//! | `hub`     | submit                             | absent                |
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement `register(lua, env, ...) -> Result<()>` that checks the
//!    capability it needs
//! 3. Call it from [`register_all`]
//!
//! Anything added to the agent column is a potential sandbox escape.

pub mod fs;
pub mod hooks;
pub mod log;

pub use hooks::{new_pending_queue, Pending, PendingQueue};

use anyhow::Result;
use mlua::{Lua, Table};

use crate::hub::hub_handle::HubHandle;
use crate::sandbox::Capabilities;

/// Register every primitive the capability set allows into `env`.
///
/// # Errors
///
/// Returns an error if any primitive registration fails.
pub fn register_all(
    lua: &Lua,
    env: &Table,
    module: &str,
    caps: &Capabilities,
    queue: &PendingQueue,
    hub: Option<&HubHandle>,
) -> Result<()> {
    log::register(lua, env, module)?;
    fs::register(lua, env, caps.fs.clone())?;
    hooks::register(lua, env, caps, queue, hub)?;
    Ok(())
}
