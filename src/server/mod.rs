//! Control-plane collaborator.
//!
//! The control-plane hands the Hub work items and receives
//! acknowledgements, heartbeats and notifications. Nothing on this path
//! makes decisions; work items become ordinary actions.
//!
//! # Modules
//!
//! - [`client`] - `ControlPlane` trait, HTTP implementation, retry backoff
//! - [`types`] - work items and request payloads

// Rust guideline compliant 2026-02

pub mod client;
pub mod types;

pub use client::{ApiClient, Backoff, ControlPlane};
pub use types::{AgentHeartbeatInfo, NotificationPayload, WorkItem};
