//! CLI subcommand implementations.
//!
//! - [`action`] - submit an action to a running Hub over its socket
//! - [`status`] - show configuration and socket location
//! - [`worktree`] - list and delete managed worktrees
//!
//! # Usage
//!
//! ```ignore
//! use agent_hub::commands;
//!
//! commands::worktree::list(None)?;
//! commands::action::run(&socket, "refresh_worktrees", Value::Null, idle, false)?;
//! ```

pub mod action;
pub mod status;
pub mod worktree;

#[doc(inline)]
pub use worktree::{delete as delete_worktree, list as list_worktrees};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
