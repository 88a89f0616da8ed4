//! Modules compiled into the hub.

use std::rc::Rc;

use anyhow::Result;
use serde_json::Value;

use super::{Module, ModuleContext};
use crate::hooks::HookOptions;

/// Name of [`LifecycleLog`] in the module registry.
pub const LIFECYCLE_LOG: &str = "core.lifecycle_log";

/// Writes one log line per agent lifecycle event.
///
/// Registered at the lowest priority so it sees events after every user
/// observer has run.
#[derive(Debug, Default)]
pub struct LifecycleLog;

fn field<'v>(payload: &'v Value, key: &str) -> &'v str {
    payload.get(key).and_then(Value::as_str).unwrap_or("?")
}

impl Module for LifecycleLog {
    fn name(&self) -> &str {
        LIFECYCLE_LOG
    }

    fn load(&mut self, ctx: &mut ModuleContext<'_>) -> Result<()> {
        let opts = HookOptions::priority(i32::MIN);

        ctx.on(
            "agent_status_changed",
            "log",
            Rc::new(|payload| {
                let status = payload
                    .get("status")
                    .and_then(|s| s.get("state"))
                    .and_then(Value::as_str)
                    .unwrap_or("?");
                log::info!("[Lifecycle] {} -> {status}", field(payload, "agent_key"));
                Ok(())
            }),
            opts.clone(),
        );
        ctx.on(
            "agent_created",
            "log",
            Rc::new(|payload| {
                log::info!(
                    "[Lifecycle] Created {} at {}",
                    field(payload, "key"),
                    field(payload, "worktree_path")
                );
                Ok(())
            }),
            opts.clone(),
        );
        ctx.on(
            "agent_deleted",
            "log",
            Rc::new(|payload| {
                log::info!("[Lifecycle] Deleted {}", field(payload, "agent_key"));
                Ok(())
            }),
            opts.clone(),
        );
        ctx.on(
            "agent_notification",
            "log",
            Rc::new(|payload| {
                let message = payload
                    .get("notification")
                    .and_then(|n| n.get("message").or_else(|| n.get("body")))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                log::info!(
                    "[Lifecycle] Notification from {}: {message}",
                    field(payload, "agent_key")
                );
                Ok(())
            }),
            opts,
        );
        Ok(())
    }
}
