//! Agent Hub - local daemon for coding-agent sessions.
//!
//! The Hub runs agents in isolated git worktrees, each with one or more
//! terminal sessions, and keeps every connected client's view of them
//! consistent.
//!
//! # Architecture
//!
//! The crate follows a centralized state store pattern:
//!
//! - **Hub** - Central orchestrator, owns state, runs the control loop
//! - **Agent** - Domain entity: a branch, its worktree and its sessions
//! - **Client** - Anything attached to the Hub; receives ordered events
//! - **Modules** - Built-in and Lua extensions contributing actions and hooks
//! - **Server** - Optional control-plane adapter
//!
//! # Modules
//!
//! - [`agent`] - Agent and PTY session management
//! - [`hub`] - Control loop, actions, ops and events
//! - [`client`] - Client registry and mirrors
//! - [`git`] - Worktree management and lifecycle scripts
//! - [`hooks`] - Observers and interceptors
//! - [`modules`] / [`lua`] / [`sandbox`] - Extension loading and capabilities
//! - [`socket`] - Unix socket surface for peers
//! - [`server`] - Control-plane client
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod agent;
pub mod client;
pub mod commands;
pub mod hub;
pub mod lua;
pub mod modules;
pub mod socket;

pub mod config;
pub mod constants;
pub mod env;
pub mod git;
pub mod hooks;
pub mod sandbox;
pub mod server;

// Re-export commonly used types
pub use agent::{Agent, AgentStatus};
pub use config::Config;
pub use git::WorktreeManager;

// Re-export Hub
pub use hub::Hub;
