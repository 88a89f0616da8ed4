//! Stock action vocabulary.
//!
//! | Action                 | Mode              | Ops                                       |
//! |------------------------|-------------------|-------------------------------------------|
//! | `spawn_agent`          | any               | `spawn_agent`                             |
//! | `close_agent`          | any               | `close_agent`, `set_mode normal`          |
//! | `cleanup_agent`        | any               | `close_agent` with worktree deletion      |
//! | `request_close`        | any               | `set_mode close-confirm`                  |
//! | `confirm`              | close-confirm     | `close_agent`, `set_mode normal`          |
//! | `confirm_delete`       | close-confirm     | `close_agent` (delete), `set_mode normal` |
//! | `open_menu`            | any               | `set_mode menu`                           |
//! | `select_worktree`      | any               | `set_mode select-worktree`, refresh       |
//! | `select`               | select-worktree   | `spawn_agent`, `set_mode normal`          |
//! | `new_worktree`         | any               | `set_mode create-worktree`                |
//! | `submit`               | create-worktree   | `spawn_agent`, `set_mode normal`          |
//! | `dismiss`              | any               | clear code if shown, `set_mode normal`    |
//! | `select_agent`         | any               | `focus`                                   |
//! | `select_next/previous` | any               | `focus_next` / `focus_previous`           |
//! | `focus_session`        | any               | `focus_session`                           |
//! | `send_input`           | any               | `write_input`                             |
//! | `resize`               | any               | `resize`                                  |
//! | `scroll`               | any               | `scroll`                                  |
//! | `set_metadata`         | any               | `set_metadata`                            |
//! | `notify`               | any               | `notify`                                  |
//! | `refresh_worktrees`    | any               | `refresh_worktrees`                       |
//! | `show_connection_code` | any               | `show_connection_code`                    |
//! | `get_screen`           | any               | `send_screen`                             |
//! | `resync`               | any               | `send_snapshot`                           |
//! | `quit`                 | any               | `quit`                                    |

use std::rc::Rc;

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{Action, ActionContext, ActionRegistry};
use crate::agent::{agent_key, ScrollDirection};
use crate::hub::ops::{HubOp, SpawnRequest};
use crate::hub::state::UiMode;

#[derive(Deserialize)]
struct CloseArgs {
    #[serde(default)]
    agent_key: Option<String>,
    #[serde(default)]
    delete_worktree: bool,
}

#[derive(Deserialize)]
struct CleanupArgs {
    #[serde(default)]
    agent_key: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    branch_name: Option<String>,
}

#[derive(Deserialize)]
struct AgentArg {
    agent_key: String,
}

#[derive(Deserialize)]
struct BranchArg {
    branch: String,
    #[serde(default)]
    profile: Option<String>,
}

#[derive(Deserialize)]
struct SessionArg {
    session: usize,
}

#[derive(Deserialize)]
struct InputArgs {
    data: String,
    #[serde(default)]
    agent_key: Option<String>,
    #[serde(default)]
    session: Option<usize>,
}

#[derive(Deserialize)]
struct ResizeArgs {
    rows: u16,
    cols: u16,
}

#[derive(Deserialize)]
struct ScrollArgs {
    direction: ScrollDirection,
}

#[derive(Deserialize)]
struct MetadataArgs {
    #[serde(default)]
    agent_key: Option<String>,
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct NotifyArgs {
    #[serde(default)]
    agent_key: Option<String>,
    message: String,
}

#[derive(Deserialize)]
struct ScreenArgs {
    #[serde(default)]
    agent_key: Option<String>,
    #[serde(default)]
    session: Option<usize>,
}

fn handler<F>(f: F) -> super::ActionHandler
where
    F: Fn(&ActionContext, &Action) -> Result<Vec<HubOp>> + 'static,
{
    Rc::new(f)
}

fn fixed(ops: Vec<HubOp>) -> super::ActionHandler {
    handler(move |_, _| Ok(ops.clone()))
}

fn set_mode(mode: UiMode) -> HubOp {
    HubOp::SetMode { mode }
}

fn close_focused(delete_worktree: bool) -> super::ActionHandler {
    handler(move |ctx, _| {
        let Some(key) = ctx.focused_agent.clone() else {
            return Ok(vec![set_mode(UiMode::Normal)]);
        };
        Ok(vec![
            HubOp::CloseAgent {
                agent_key: Some(key),
                delete_worktree,
            },
            set_mode(UiMode::Normal),
        ])
    })
}

fn spawn_from_branch() -> super::ActionHandler {
    handler(|_, action| {
        let args: BranchArg = action.payload()?;
        let mut req = SpawnRequest::new(args.branch);
        req.profile = args.profile;
        Ok(vec![HubOp::SpawnAgent(req), set_mode(UiMode::Normal)])
    })
}

/// Registers the stock handlers (owned by no module).
pub fn register_builtin(registry: &mut ActionRegistry) {
    let mut add = |name: &str, mode: Option<UiMode>, h: super::ActionHandler| {
        registry.register(name, mode, h, None);
    };

    add(
        "spawn_agent",
        None,
        handler(|_, action| Ok(vec![HubOp::SpawnAgent(action.payload()?)])),
    );
    add(
        "close_agent",
        None,
        handler(|_, action| {
            let args: CloseArgs = action.payload()?;
            Ok(vec![
                HubOp::CloseAgent {
                    agent_key: args.agent_key,
                    delete_worktree: args.delete_worktree,
                },
                set_mode(UiMode::Normal),
            ])
        }),
    );
    add(
        "cleanup_agent",
        None,
        handler(|_, action| {
            let args: CleanupArgs = action.payload()?;
            let key = match (args.agent_key, args.repo, args.branch_name) {
                (Some(key), _, _) => key,
                (None, Some(repo), Some(branch)) => agent_key(&repo, &branch),
                _ => bail!("cleanup_agent needs agent_key or repo and branch_name"),
            };
            Ok(vec![HubOp::CloseAgent {
                agent_key: Some(key),
                delete_worktree: true,
            }])
        }),
    );
    add(
        "request_close",
        None,
        handler(|ctx, _| {
            if ctx.focused_agent.is_none() {
                return Ok(vec![HubOp::ShowError {
                    message: "No agent selected".to_string(),
                }]);
            }
            Ok(vec![set_mode(UiMode::CloseConfirm)])
        }),
    );
    add("confirm", Some(UiMode::CloseConfirm), close_focused(false));
    add("confirm_delete", Some(UiMode::CloseConfirm), close_focused(true));

    add("open_menu", None, fixed(vec![set_mode(UiMode::Menu)]));
    add(
        "select_worktree",
        None,
        fixed(vec![set_mode(UiMode::SelectWorktree), HubOp::RefreshWorktrees]),
    );
    add("select", Some(UiMode::SelectWorktree), spawn_from_branch());
    add("new_worktree", None, fixed(vec![set_mode(UiMode::CreateWorktree)]));
    add("submit", Some(UiMode::CreateWorktree), spawn_from_branch());
    add(
        "dismiss",
        None,
        handler(|ctx, _| {
            let mut ops = Vec::new();
            if ctx.mode == UiMode::ConnectionCode {
                ops.push(HubOp::ClearConnectionCode);
            }
            ops.push(set_mode(UiMode::Normal));
            Ok(ops)
        }),
    );

    add(
        "select_agent",
        None,
        handler(|_, action| {
            let args: AgentArg = action.payload()?;
            Ok(vec![HubOp::Focus {
                agent_key: args.agent_key,
            }])
        }),
    );
    add("select_next", None, fixed(vec![HubOp::FocusNext]));
    add("select_previous", None, fixed(vec![HubOp::FocusPrevious]));
    add(
        "focus_session",
        None,
        handler(|_, action| {
            let args: SessionArg = action.payload()?;
            Ok(vec![HubOp::FocusSession {
                session: args.session,
            }])
        }),
    );
    add(
        "send_input",
        None,
        handler(|_, action| {
            let args: InputArgs = action.payload()?;
            Ok(vec![HubOp::WriteInput {
                agent_key: args.agent_key,
                session: args.session,
                data: args.data,
            }])
        }),
    );
    add(
        "resize",
        None,
        handler(|_, action| {
            let args: ResizeArgs = action.payload()?;
            Ok(vec![HubOp::Resize {
                rows: args.rows,
                cols: args.cols,
            }])
        }),
    );
    add(
        "scroll",
        None,
        handler(|_, action| {
            let args: ScrollArgs = action.payload()?;
            Ok(vec![HubOp::Scroll {
                direction: args.direction,
            }])
        }),
    );
    add(
        "set_metadata",
        None,
        handler(|_, action| {
            let args: MetadataArgs = action.payload()?;
            Ok(vec![HubOp::SetMetadata {
                agent_key: args.agent_key,
                key: args.key,
                value: args.value,
            }])
        }),
    );
    add(
        "notify",
        None,
        handler(|_, action| {
            let args: NotifyArgs = action.payload()?;
            Ok(vec![HubOp::Notify {
                agent_key: args.agent_key,
                message: args.message,
            }])
        }),
    );
    add("refresh_worktrees", None, fixed(vec![HubOp::RefreshWorktrees]));
    add("show_connection_code", None, fixed(vec![HubOp::ShowConnectionCode]));
    add(
        "get_screen",
        None,
        handler(|_, action| {
            let args: ScreenArgs = action.payload()?;
            Ok(vec![HubOp::SendScreen {
                agent_key: args.agent_key,
                session: args.session,
            }])
        }),
    );
    add("resync", None, fixed(vec![HubOp::SendSnapshot]));
    add("quit", None, fixed(vec![HubOp::Quit]));
}
