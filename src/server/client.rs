//! Control-plane client.
//!
//! [`ControlPlane`] is the four-call surface the Hub needs from its
//! collaborator. [`ApiClient`] implements it over HTTP with
//! `reqwest::blocking`; tests substitute an in-memory fake. Every call is
//! made from the control-plane worker thread, never from the Hub loop.

use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::blocking::Client;

use super::types::{AgentHeartbeatInfo, HeartbeatPayload, NotificationPayload, WorkItem, WorkItemResponse};
use crate::constants;

/// Operations the Hub consumes from the control-plane.
pub trait ControlPlane: Send {
    /// Pending work items.
    fn poll(&mut self) -> Result<Vec<WorkItem>>;

    /// Marks a work item as taken.
    fn acknowledge(&mut self, id: i64) -> Result<()>;

    /// Reports the live agent roster.
    fn heartbeat(&mut self, agents: &[AgentHeartbeatInfo]) -> Result<()>;

    /// Forwards a notification raised by an agent.
    fn notify(&mut self, notification: &NotificationPayload) -> Result<()>;
}

/// HTTP client for the control-plane API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    server_url: String,
    api_key: String,
    hub_id: String,
    repo: String,
}

impl ApiClient {
    /// Creates a client for `server_url`, identifying as `hub_id` serving `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: &str, api_key: &str, hub_id: &str, repo: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            hub_id: hub_id.to_string(),
            repo: repo.to_string(),
        })
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/hubs/{}{path}", self.server_url, self.hub_id)
    }
}

impl ControlPlane for ApiClient {
    fn poll(&mut self) -> Result<Vec<WorkItem>> {
        let response = self
            .client
            .get(self.url("/messages"))
            .query(&[("repo", self.repo.as_str())])
            .bearer_auth(&self.api_key)
            .send()?;

        if !response.status().is_success() {
            bail!("Failed to poll messages: {}", response.status());
        }
        let body: WorkItemResponse = response.json()?;
        Ok(body.messages)
    }

    fn acknowledge(&mut self, id: i64) -> Result<()> {
        let response = self
            .client
            .patch(self.url(&format!("/messages/{id}")))
            .bearer_auth(&self.api_key)
            .send()?;

        if !response.status().is_success() {
            bail!("Failed to acknowledge message {id}: {}", response.status());
        }
        log::debug!("[ControlPlane] acknowledged message {id}");
        Ok(())
    }

    fn heartbeat(&mut self, agents: &[AgentHeartbeatInfo]) -> Result<()> {
        let payload = HeartbeatPayload {
            repo: self.repo.clone(),
            agents: agents.to_vec(),
        };
        let response = self
            .client
            .put(self.url(""))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()?;

        if !response.status().is_success() {
            bail!(
                "Heartbeat failed: {} - {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        log::debug!("[ControlPlane] heartbeat sent: {} agents", agents.len());
        Ok(())
    }

    fn notify(&mut self, notification: &NotificationPayload) -> Result<()> {
        let response = self
            .client
            .post(self.url("/notifications"))
            .bearer_auth(&self.api_key)
            .json(notification)
            .send()?;

        if !response.status().is_success() {
            bail!(
                "Failed to send notification: {} - {}",
                response.status(),
                response.text().unwrap_or_default()
            );
        }
        log::info!("[ControlPlane] notification sent for {}", notification.agent_key);
        Ok(())
    }
}

/// Capped exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(constants::BACKOFF_INITIAL, constants::BACKOFF_MAX)
    }
}

impl Backoff {
    /// Backoff starting at `initial` and never exceeding `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Records a success.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Current delay, zero after a success.
    pub fn delay(&self) -> Duration {
        self.current.unwrap_or_default()
    }
}
