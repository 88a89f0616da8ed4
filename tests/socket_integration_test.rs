mod common;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use agent_hub::hub::HubEvent;
use agent_hub::socket::{Incoming, PeerConnection};
use agent_hub::Hub;
use anyhow::Result;
use common::{config, init_repo};
use serde_json::json;
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads events until one named `name` arrives; returns every name seen.
fn recv_until(peer: &mut PeerConnection, name: &str) -> Result<Vec<String>> {
    let deadline = Instant::now() + RECV_TIMEOUT;
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        match peer.recv(Duration::from_millis(200))? {
            Some(Incoming::Event(envelope)) => {
                let label = match &envelope.event {
                    HubEvent::AgentStatusChanged { status, .. } => {
                        format!("status:{}", status.as_str())
                    }
                    other => other.name().to_string(),
                };
                let done = label == name;
                seen.push(label);
                if done {
                    return Ok(seen);
                }
            }
            Some(Incoming::Error(message)) => seen.push(format!("error:{message}")),
            None => {}
        }
    }
    anyhow::bail!("timed out waiting for {name}; saw {seen:?}")
}

/// Runs the Hub on this thread while `peer` runs on another.
fn with_hub<T: Send + 'static>(
    peer: impl FnOnce(PathBuf) -> Result<T> + Send + 'static,
) -> (Hub, T) {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let socket = tmp.path().join("hub.sock");
    let mut hub = Hub::new(config(tmp.path(), "cat"), repo).unwrap();
    hub.start_socket_server(&socket).unwrap();

    let worker = std::thread::spawn(move || peer(socket));
    let deadline = Instant::now() + Duration::from_secs(30);
    while !worker.is_finished() && Instant::now() < deadline {
        hub.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(worker.is_finished(), "peer did not finish");
    let result = worker.join().unwrap().unwrap();
    hub.shutdown();
    drop(tmp);
    (hub, result)
}

#[test]
fn test_peer_receives_snapshot_then_spawn_progress() {
    let (hub, seen) = with_hub(|socket| {
        let mut peer = PeerConnection::connect(&socket)?;
        let snapshot = recv_until(&mut peer, "profiles")?;
        peer.send_action("spawn_agent", json!({ "branch": "via-socket" }))?;
        let progress = recv_until(&mut peer, "worktree_list")?;
        Ok((snapshot, progress))
    });

    assert_eq!(hub.state.len(), 0);
    assert_eq!(seen.0, vec!["agent_list", "worktree_list", "profiles"]);
    assert_eq!(
        seen.1,
        vec![
            "status:creating_worktree",
            "status:spawning_sessions",
            "agent_created",
            "status:running",
            "worktree_list",
        ]
    );
}

#[test]
fn test_unknown_action_reports_error() {
    let (_hub, seen) = with_hub(|socket| {
        let mut peer = PeerConnection::connect(&socket)?;
        recv_until(&mut peer, "profiles")?;
        peer.send_action("no_such_action", json!({}))?;
        recv_until(&mut peer, "error")
    });

    assert_eq!(seen, vec!["error"]);
}

#[test]
fn test_quit_action_stops_hub() {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let socket = tmp.path().join("hub.sock");
    let mut hub = Hub::new(config(tmp.path(), "cat"), repo).unwrap();
    hub.start_socket_server(&socket).unwrap();

    let peer_socket = socket.clone();
    let worker = std::thread::spawn(move || -> Result<()> {
        let mut peer = PeerConnection::connect(&peer_socket)?;
        recv_until(&mut peer, "profiles")?;
        peer.send_action("quit", json!(null))
    });

    let flag = std::sync::atomic::AtomicBool::new(false);
    let started = Instant::now();
    hub.run(&flag).unwrap();

    assert!(hub.quit);
    assert!(started.elapsed() < Duration::from_secs(30));
    worker.join().unwrap().unwrap();
    assert!(!socket.exists());
}
