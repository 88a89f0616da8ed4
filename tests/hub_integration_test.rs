mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use agent_hub::agent::agent_key;
use agent_hub::client::LocalClient;
use agent_hub::hooks::HookOptions;
use agent_hub::hub::HubEvent;
use agent_hub::{AgentStatus, Hub};
use common::{config, init_repo, wait_for};
use serde_json::json;
use tempfile::TempDir;

struct Setup {
    _tmp: TempDir,
    hub: Hub,
    client: LocalClient,
}

fn setup(command: &str) -> Setup {
    let tmp = TempDir::new().unwrap();
    let repo = init_repo(tmp.path(), "repo");
    let mut hub = Hub::new(config(tmp.path(), command), repo).unwrap();
    let mut client = LocalClient::connect(hub.handle()).unwrap();
    hub.tick();
    client.pump();
    Setup {
        _tmp: tmp,
        hub,
        client,
    }
}

fn names(envelopes: &[agent_hub::hub::EventEnvelope]) -> Vec<String> {
    envelopes
        .iter()
        .map(|e| match &e.event {
            HubEvent::AgentStatusChanged { status, .. } => format!("status:{}", status.as_str()),
            other => other.name().to_string(),
        })
        .collect()
}

#[test]
fn test_snapshot_populates_mirror() {
    let s = setup("cat");
    let state = s.client.mirror().state();
    assert!(state.agents.is_empty());
    assert!(state.worktrees.is_empty());
    assert_eq!(state.profiles, vec!["default".to_string()]);
    assert_eq!(s.client.mirror().last_seq(), Some(3));
}

#[test]
fn test_spawn_through_client_yields_one_running_record() {
    let mut s = setup("cat");
    s.client
        .submit("spawn_agent", json!({ "branch": "feature-a" }))
        .unwrap();
    s.hub.tick();
    let applied = s.client.pump();

    assert_eq!(
        names(&applied),
        vec![
            "status:creating_worktree",
            "status:spawning_sessions",
            "agent_created",
            "status:running",
            "worktree_list",
        ]
    );
    let seqs: Vec<u64> = applied.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![4, 5, 6, 7, 8]);

    let key = agent_key(s.hub.repo_name(), "feature-a");
    let state = s.client.mirror().state();
    assert_eq!(state.agents.iter().filter(|a| a.key == key).count(), 1);
    assert!(state.pending.is_empty());
    assert_eq!(state.selected.as_deref(), Some(key.as_str()));
    assert_eq!(state.agent(&key).unwrap().status, AgentStatus::Running);
    assert_eq!(state.worktrees.len(), 1);
    assert_eq!(state.worktrees[0].branch.as_deref(), Some("feature-a"));

    s.hub.shutdown();
}

#[test]
fn test_keystrokes_reach_focused_session() {
    let mut s = setup("cat");
    s.client
        .submit("spawn_agent", json!({ "branch": "echo-me" }))
        .unwrap();
    s.hub.tick();
    s.client.pump();
    let key = agent_key(s.hub.repo_name(), "echo-me");

    s.client.send_keys(b"hello-hub\r").unwrap();
    s.hub.tick();

    let hub = &mut s.hub;
    let seen = wait_for(Duration::from_secs(5), || {
        hub.tick();
        hub.state
            .get(&key)
            .and_then(|a| a.session(0))
            .is_some_and(|session| session.snapshot().text().contains("hello-hub"))
    });
    assert!(seen);

    s.hub.shutdown();
}

#[test]
fn test_close_stops_streaming_session_before_teardown() {
    let mut s = setup("yes");
    let teardown_marker = s._tmp.path().join("teardown_ran");
    std::fs::write(
        s._tmp.path().join("repo").join(".agent_hub_teardown"),
        format!("echo done > {}\n", teardown_marker.display()),
    )
    .unwrap();

    s.client
        .submit("spawn_agent", json!({ "branch": "noisy" }))
        .unwrap();
    s.hub.tick();
    s.client.pump();
    let key = agent_key(s.hub.repo_name(), "noisy");
    let worktree = s
        .client
        .mirror()
        .state()
        .agent(&key)
        .and_then(|a| a.worktree_path.clone())
        .unwrap();
    assert!(worktree.is_dir());
    let terminated = s
        .hub
        .state
        .get(&key)
        .and_then(|a| a.session(0))
        .unwrap()
        .terminated_flag();

    // (reader stopped, teardown already ran) as seen when removal starts
    let seen_at_removal = Rc::new(RefCell::new(None));
    let record = Rc::clone(&seen_at_removal);
    let marker = teardown_marker.clone();
    s.hub.hooks_mut().on(
        "agent_status_changed",
        "order",
        Rc::new(move |payload: &serde_json::Value| {
            if payload["status"]["state"] == "removing_worktree" {
                *record.borrow_mut() = Some((terminated.load(Ordering::SeqCst), marker.exists()));
            }
            Ok(())
        }),
        HookOptions::default(),
    );

    for _ in 0..5 {
        s.hub.tick();
        std::thread::sleep(Duration::from_millis(20));
    }

    s.client
        .submit(
            "close_agent",
            json!({ "agent_key": key, "delete_worktree": true }),
        )
        .unwrap();
    s.hub.tick();
    let applied = s.client.pump();

    assert_eq!(
        names(&applied),
        vec![
            "status:stopping",
            "status:removing_worktree",
            "status:deleted",
            "agent_deleted",
            "worktree_list",
        ]
    );
    assert_eq!(*seen_at_removal.borrow(), Some((true, false)));
    assert!(teardown_marker.is_file());
    assert!(s.hub.state.get(&key).is_none());
    assert!(s.client.mirror().state().agents.is_empty());
    assert!(s.client.mirror().state().selected.is_none());
    assert!(!worktree.exists());
}

#[test]
fn test_select_agent_moves_focus_on_every_mirror() {
    let mut s = setup("cat");
    for branch in ["a", "b"] {
        s.client
            .submit("spawn_agent", json!({ "branch": branch }))
            .unwrap();
    }
    s.hub.tick();
    s.client.pump();
    let a = agent_key(s.hub.repo_name(), "a");
    let b = agent_key(s.hub.repo_name(), "b");
    assert_eq!(s.hub.state.focused(), Some(b.as_str()));

    let mut other = LocalClient::connect_as(
        s.hub.handle(),
        agent_hub::client::ClientId::Peer(3),
    )
    .unwrap();
    s.hub.tick();
    other.pump();

    s.client
        .submit("select_agent", json!({ "agent_key": a }))
        .unwrap();
    s.hub.tick();
    let applied = s.client.pump();
    other.pump();

    assert_eq!(names(&applied), vec!["focus_changed"]);
    assert_eq!(s.hub.state.focused(), Some(a.as_str()));
    assert_eq!(s.client.mirror().state().selected.as_deref(), Some(a.as_str()));
    assert_eq!(other.mirror().state().selected.as_deref(), Some(a.as_str()));

    s.client.send_keys(b"to-a\r").unwrap();
    let hub = &mut s.hub;
    let echoed = wait_for(Duration::from_secs(5), || {
        hub.tick();
        hub.state
            .get(&a)
            .and_then(|agent| agent.session(0))
            .is_some_and(|session| session.snapshot().text().contains("to-a"))
    });
    assert!(echoed);

    s.hub.shutdown();
}

#[test]
fn test_second_client_sees_same_agents() {
    let mut s = setup("cat");
    s.client
        .submit("spawn_agent", json!({ "branch": "shared" }))
        .unwrap();
    s.hub.tick();
    s.client.pump();

    let mut late = LocalClient::connect_as(
        s.hub.handle(),
        agent_hub::client::ClientId::Peer(77),
    )
    .unwrap();
    s.hub.tick();
    late.pump();

    assert_eq!(
        late.mirror().state().agents,
        s.client.mirror().state().agents
    );
    assert_eq!(late.mirror().last_seq(), Some(3));

    s.hub.shutdown();
}

#[test]
fn test_errors_reach_only_the_requesting_client() {
    let mut s = setup("cat");
    let mut other = LocalClient::connect_as(
        s.hub.handle(),
        agent_hub::client::ClientId::Peer(5),
    )
    .unwrap();
    s.hub.tick();
    other.pump();

    s.client
        .submit("spawn_agent", json!({ "branch": "x", "profile": "missing" }))
        .unwrap();
    s.hub.tick();
    s.client.pump();
    let seen_by_other = other.pump();

    assert!(s
        .client
        .mirror()
        .state()
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("Unknown profile")));
    assert!(seen_by_other
        .iter()
        .all(|e| !matches!(e.event, HubEvent::Error { .. })));
}
