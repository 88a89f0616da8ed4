//! Control-plane worker.
//!
//! All control-plane I/O runs on one background thread so the Hub loop
//! never blocks on the network. The worker:
//!
//! - polls for work items every `poll_interval` and submits the ones the
//!   Hub understands as ordinary actions through the [`HubHandle`]
//! - acknowledges items once the Hub reports them handled
//! - forwards heartbeats and notifications queued by the Hub
//!
//! Failed polls and deliveries back off exponentially (capped); the Hub
//! keeps running locally whatever the control-plane does.

// Rust guideline compliant 2026-02

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::hub_handle::HubHandle;
use crate::constants::{MAX_PENDING_DELIVERIES, WORKER_TICK};
use crate::server::{AgentHeartbeatInfo, Backoff, ControlPlane, NotificationPayload};

/// Request from the Hub to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// A work item was handled.
    Acknowledge(i64),
    /// Current roster.
    Heartbeat(Vec<AgentHeartbeatInfo>),
    /// Agent notification.
    Notify(NotificationPayload),
}

/// Background control-plane worker.
pub struct ControlPlaneWorker {
    command_tx: std_mpsc::Sender<WorkerCommand>,
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ControlPlaneWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneWorker")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct WorkerLoop {
    plane: Box<dyn ControlPlane>,
    hub: HubHandle,
    poll_interval: Duration,
    next_poll: Instant,
    poll_backoff: Backoff,
    /// Commands whose delivery failed, retried in order.
    retry: VecDeque<WorkerCommand>,
    retry_at: Instant,
    retry_backoff: Backoff,
    /// Submitted but not yet acknowledged.
    in_flight: HashSet<i64>,
}

impl ControlPlaneWorker {
    /// Start the worker thread.
    pub fn spawn(plane: Box<dyn ControlPlane>, hub: HubHandle, poll_interval: Duration) -> Self {
        let (command_tx, command_rx) = std_mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let thread_handle = thread::Builder::new()
            .name("control-plane".to_string())
            .spawn(move || {
                let now = Instant::now();
                let mut worker = WorkerLoop {
                    plane,
                    hub,
                    poll_interval,
                    next_poll: now,
                    poll_backoff: Backoff::default(),
                    retry: VecDeque::new(),
                    retry_at: now,
                    retry_backoff: Backoff::default(),
                    in_flight: HashSet::new(),
                };
                worker.run(&command_rx, &shutdown_clone);
            })
            .map_err(|e| log::error!("[ControlPlane] failed to start worker: {e}"))
            .ok();

        Self {
            command_tx,
            shutdown,
            thread_handle,
        }
    }

    fn send(&self, command: WorkerCommand) {
        let _ = self.command_tx.send(command);
    }

    /// Acknowledge a handled work item.
    pub fn acknowledge(&self, id: i64) {
        self.send(WorkerCommand::Acknowledge(id));
    }

    /// Queue a heartbeat.
    pub fn heartbeat(&self, agents: Vec<AgentHeartbeatInfo>) {
        self.send(WorkerCommand::Heartbeat(agents));
    }

    /// Queue a notification.
    pub fn notify(&self, notification: NotificationPayload) {
        self.send(WorkerCommand::Notify(notification));
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for ControlPlaneWorker {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl WorkerLoop {
    fn run(&mut self, command_rx: &std_mpsc::Receiver<WorkerCommand>, shutdown: &AtomicBool) {
        log::info!("[ControlPlane] worker started");
        loop {
            if shutdown.load(Ordering::SeqCst) {
                // Drain what the Hub queued before stopping.
                while let Ok(command) = command_rx.try_recv() {
                    self.deliver(command);
                }
                log::info!("[ControlPlane] worker shutting down");
                break;
            }

            match command_rx.recv_timeout(WORKER_TICK) {
                Ok(command) => self.deliver(command),
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    log::info!("[ControlPlane] command channel closed");
                    break;
                }
            }

            let now = Instant::now();
            if !self.retry.is_empty() && now >= self.retry_at {
                self.flush_retries();
            }
            if now >= self.next_poll && !self.poll_once() {
                break;
            }
        }
    }

    /// Polls once. Returns `false` when the Hub is gone.
    fn poll_once(&mut self) -> bool {
        match self.plane.poll() {
            Ok(items) => {
                self.poll_backoff.reset();
                self.next_poll = Instant::now() + self.poll_interval;
                for item in items {
                    if self.in_flight.contains(&item.id) {
                        continue;
                    }
                    match item.to_action() {
                        Some(action) => {
                            log::info!("[ControlPlane] work item {} -> {}", item.id, action.name);
                            if self.hub.submit(action).is_err() {
                                return false;
                            }
                            self.in_flight.insert(item.id);
                        }
                        None => {
                            log::debug!(
                                "[ControlPlane] ignoring work item {} ({})",
                                item.id,
                                item.event_type
                            );
                            self.deliver(WorkerCommand::Acknowledge(item.id));
                        }
                    }
                }
            }
            Err(e) => {
                let delay = self.poll_backoff.fail();
                log::warn!("[ControlPlane] poll failed, retrying in {delay:?}: {e:#}");
                self.next_poll = Instant::now() + delay;
            }
        }
        true
    }

    fn deliver(&mut self, command: WorkerCommand) {
        if !self.retry.is_empty() && !matches!(command, WorkerCommand::Heartbeat(_)) {
            // Keep order behind earlier failures.
            self.queue_retry(command);
            return;
        }
        if let Err(e) = self.send(&command) {
            self.on_failure(command, &e);
        }
    }

    fn flush_retries(&mut self) {
        while let Some(command) = self.retry.pop_front() {
            if let Err(e) = self.send(&command) {
                self.retry.push_front(command);
                let delay = self.retry_backoff.fail();
                log::warn!("[ControlPlane] delivery still failing, retrying in {delay:?}: {e:#}");
                self.retry_at = Instant::now() + delay;
                return;
            }
        }
        self.retry_backoff.reset();
    }

    fn on_failure(&mut self, command: WorkerCommand, err: &anyhow::Error) {
        match command {
            WorkerCommand::Heartbeat(_) => {
                log::warn!("[ControlPlane] heartbeat failed: {err:#}");
            }
            other => {
                let delay = self.retry_backoff.fail();
                log::warn!("[ControlPlane] delivery failed, retrying in {delay:?}: {err:#}");
                self.retry_at = Instant::now() + delay;
                self.queue_retry(other);
            }
        }
    }

    fn queue_retry(&mut self, command: WorkerCommand) {
        if self.retry.len() >= MAX_PENDING_DELIVERIES {
            if let Some(dropped) = self.retry.pop_front() {
                log::warn!("[ControlPlane] retry queue full, dropping {dropped:?}");
            }
        }
        self.retry.push_back(command);
    }

    fn send(&mut self, command: &WorkerCommand) -> Result<()> {
        match command {
            WorkerCommand::Acknowledge(id) => {
                self.plane.acknowledge(*id)?;
                self.in_flight.remove(id);
            }
            WorkerCommand::Heartbeat(agents) => self.plane.heartbeat(agents)?,
            WorkerCommand::Notify(notification) => self.plane.notify(notification)?,
        }
        Ok(())
    }
}

/// Stable identifier for this hub, created on first use under `dir`.
pub fn load_or_create_hub_id(dir: &Path) -> Result<String> {
    let path = dir.join("hub_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::input::HubInput;
    use crate::server::WorkItem;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorded {
        pending: Vec<WorkItem>,
        acked: Vec<i64>,
        heartbeats: usize,
        notified: Vec<String>,
        fail_polls: usize,
        polls: usize,
    }

    #[derive(Clone, Default)]
    struct FakePlane(Arc<Mutex<Recorded>>);

    impl ControlPlane for FakePlane {
        fn poll(&mut self) -> Result<Vec<WorkItem>> {
            let mut rec = self.0.lock().unwrap();
            rec.polls += 1;
            if rec.fail_polls > 0 {
                rec.fail_polls -= 1;
                anyhow::bail!("unreachable");
            }
            Ok(rec.pending.clone())
        }

        fn acknowledge(&mut self, id: i64) -> Result<()> {
            let mut rec = self.0.lock().unwrap();
            rec.acked.push(id);
            rec.pending.retain(|i| i.id != id);
            Ok(())
        }

        fn heartbeat(&mut self, _agents: &[AgentHeartbeatInfo]) -> Result<()> {
            self.0.lock().unwrap().heartbeats += 1;
            Ok(())
        }

        fn notify(&mut self, notification: &NotificationPayload) -> Result<()> {
            self.0.lock().unwrap().notified.push(notification.message.clone());
            Ok(())
        }
    }

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_work_item_submitted_once_until_acknowledged() {
        let plane = FakePlane::default();
        plane.0.lock().unwrap().pending.push(WorkItem {
            id: 11,
            event_type: "issue_comment".into(),
            payload: serde_json::json!({"issue_number": 4}),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = ControlPlaneWorker::spawn(
            Box::new(plane.clone()),
            HubHandle::new(tx),
            Duration::from_millis(10),
        );

        assert!(wait_until(|| plane.0.lock().unwrap().polls >= 3));
        let mut submitted = Vec::new();
        while let Ok(input) = rx.try_recv() {
            if let HubInput::Action(action) = input {
                submitted.push(action);
            }
        }
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "spawn_agent");
        assert_eq!(submitted[0].work_item_id.as_deref(), Some("11"));

        worker.acknowledge(11);
        assert!(wait_until(|| plane.0.lock().unwrap().acked == vec![11]));
    }

    #[test]
    fn test_ignored_items_are_acknowledged() {
        let plane = FakePlane::default();
        plane.0.lock().unwrap().pending.push(WorkItem {
            id: 3,
            event_type: "push".into(),
            payload: serde_json::Value::Null,
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let _worker = ControlPlaneWorker::spawn(
            Box::new(plane.clone()),
            HubHandle::new(tx),
            Duration::from_millis(10),
        );
        assert!(wait_until(|| plane.0.lock().unwrap().acked == vec![3]));
    }

    #[test]
    fn test_failed_poll_backs_off_and_recovers() {
        let plane = FakePlane::default();
        plane.0.lock().unwrap().fail_polls = 1;
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = ControlPlaneWorker::spawn(
            Box::new(plane.clone()),
            HubHandle::new(tx),
            Duration::from_millis(10),
        );
        // First retry waits BACKOFF_INITIAL (1s).
        assert!(wait_until(|| plane.0.lock().unwrap().polls >= 2));

        worker.heartbeat(Vec::new());
        worker.notify(NotificationPayload {
            agent_key: "k".into(),
            message: "done".into(),
        });
        assert!(wait_until(|| {
            let rec = plane.0.lock().unwrap();
            rec.heartbeats == 1 && rec.notified == vec!["done".to_string()]
        }));
    }

    #[test]
    fn test_retry_queue_drops_oldest_when_full() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut worker = WorkerLoop {
            plane: Box::new(FakePlane::default()),
            hub: HubHandle::new(tx),
            poll_interval: Duration::from_secs(60),
            next_poll: now,
            poll_backoff: Backoff::default(),
            retry: VecDeque::new(),
            retry_at: now,
            retry_backoff: Backoff::default(),
            in_flight: HashSet::new(),
        };

        for id in 0..(MAX_PENDING_DELIVERIES as i64 + 5) {
            worker.queue_retry(WorkerCommand::Acknowledge(id));
        }

        assert_eq!(worker.retry.len(), MAX_PENDING_DELIVERIES);
        assert_eq!(worker.retry.front(), Some(&WorkerCommand::Acknowledge(5)));
    }

    #[test]
    fn test_hub_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_hub_id(dir.path()).unwrap();
        assert_eq!(load_or_create_hub_id(dir.path()).unwrap(), first);
    }
}
