//! Control-plane data types.
//!
//! Work items arrive as `{id, event_type, payload}` records. The payload is
//! whatever the control-plane relayed (a forge webhook, a manual request);
//! [`WorkItem::to_action`] turns the ones the Hub understands into actions.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::agent_key;
use crate::hub::actions::Action;
use crate::client::ClientId;

/// Unit of work relayed by the control-plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier used for acknowledgement.
    pub id: i64,
    /// Kind of event (e.g. `issue_comment`, `agent_cleanup`).
    pub event_type: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    /// Repository in `owner/repo` form.
    pub fn repo(&self) -> Option<&str> {
        self.payload
            .get("repository")
            .and_then(|r| r.get("full_name"))
            .and_then(Value::as_str)
            .or_else(|| self.payload.get("repo").and_then(Value::as_str))
    }

    /// Issue or pull-request number.
    pub fn issue_number(&self) -> Option<u64> {
        self.payload
            .get("issue_number")
            .and_then(Value::as_u64)
            .or_else(|| {
                self.payload
                    .get("issue")
                    .and_then(|i| i.get("number"))
                    .and_then(Value::as_u64)
            })
            .or_else(|| {
                self.payload
                    .get("pull_request")
                    .and_then(|pr| pr.get("number"))
                    .and_then(Value::as_u64)
            })
    }

    /// Task description, if the item carries one.
    pub fn prompt(&self) -> Option<&str> {
        self.payload
            .get("prompt")
            .and_then(Value::as_str)
            .or_else(|| self.payload.get("comment_body").and_then(Value::as_str))
    }

    /// Branch the agent should work on: explicit, else `issue-<n>`.
    pub fn branch_name(&self) -> Option<String> {
        self.payload
            .get("branch")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.issue_number().map(|n| format!("issue-{n}")))
    }

    /// Whether this item asks for an agent to be torn down.
    pub fn is_cleanup(&self) -> bool {
        matches!(self.event_type.as_str(), "agent_cleanup" | "cleanup_agent")
    }

    /// Action the Hub should run, or `None` for items it ignores.
    pub fn to_action(&self) -> Option<Action> {
        let branch = self.branch_name()?;
        let action = if self.is_cleanup() {
            let key = agent_key(self.repo().unwrap_or_default(), &branch);
            Action::new(
                "cleanup_agent",
                json!({"agent_key": key, "repo": self.repo(), "branch_name": branch}),
            )
        } else {
            match self.event_type.as_str() {
                "issue_comment" | "pull_request" | "spawn_agent" => {
                    let mut metadata = serde_json::Map::new();
                    if let Some(prompt) = self.prompt() {
                        metadata.insert("prompt".into(), json!(prompt));
                    }
                    if let Some(url) = self.payload.get("issue_url") {
                        metadata.insert("invocation_url".into(), url.clone());
                    }
                    Action::new(
                        "spawn_agent",
                        json!({
                            "branch": branch,
                            "issue_number": self.issue_number(),
                            "profile": self.payload.get("profile"),
                            "focus": false,
                            "metadata": metadata,
                        }),
                    )
                }
                _ => return None,
            }
        };
        Some(action.from_client(ClientId::ControlPlane).with_work_item(self.id.to_string()))
    }
}

/// Poll response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkItemResponse {
    /// Pending items.
    #[serde(default)]
    pub messages: Vec<WorkItem>,
}

/// Agent entry in a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentHeartbeatInfo {
    /// Agent key.
    pub session_key: String,
    /// Status name.
    pub status: String,
    /// Issue or task number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
}

/// Heartbeat request payload.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    /// Repository this hub serves.
    pub repo: String,
    /// Live agents.
    pub agents: Vec<AgentHeartbeatInfo>,
}

/// Notification request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    /// Agent key.
    pub agent_key: String,
    /// Message shown to the user.
    pub message: String,
}
