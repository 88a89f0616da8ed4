//! Client-side mirror of Hub state.
//!
//! A mirror changes only by applying [`OpBatch`]es, and a batch can only be
//! built from an [`EventEnvelope`]. The mirror accepts batches strictly in
//! sequence order: a batch whose `seq` is not exactly one past the last
//! applied one is refused and the mirror flags itself for resync. Likewise
//! the Hub generation stamped on a batch must equal the mirror's generation
//! plus the structural changes the batch makes; anything else means events
//! were lost.
//!
//! While flagged, incremental batches are refused until an `agent_list`
//! snapshot arrives, which replaces the agent set and resets sequence and
//! generation tracking.

use std::collections::BTreeMap;

use super::ops::{ops_for_event, MirrorOp};
use crate::agent::{AgentInfo, AgentStatus, ScreenSnapshot};
use crate::git::WorktreeInfo;
use crate::hub::events::{EventEnvelope, HubEvent, PairingCode};

/// Reasons a batch is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    /// Batch arrived out of order.
    #[error("expected event {expected}, got {got}")]
    SequenceGap {
        /// Next expected sequence number.
        expected: u64,
        /// Sequence number received.
        got: u64,
    },
    /// Generation does not line up with the structural changes seen.
    #[error("expected generation {expected}, got {got}")]
    GenerationGap {
        /// Generation the batch should carry.
        expected: u64,
        /// Generation it carried.
        got: u64,
    },
    /// A resync is pending and only a snapshot is accepted.
    #[error("waiting for agent_list resync")]
    AwaitingResync,
}

/// Ops derived from one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct OpBatch {
    seq: u64,
    generation: u64,
    snapshot: bool,
    ops: Vec<MirrorOp>,
}

impl OpBatch {
    /// Translates an envelope.
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            seq: envelope.seq,
            generation: envelope.generation,
            snapshot: matches!(envelope.event, HubEvent::AgentList { .. }),
            ops: ops_for_event(&envelope.event),
        }
    }

    /// Sequence number of the source envelope.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The ops, in application order.
    pub fn ops(&self) -> &[MirrorOp] {
        &self.ops
    }
}

/// Everything a client knows about the Hub.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorState {
    /// Agents in Hub order.
    pub agents: Vec<AgentInfo>,
    /// Focused agent.
    pub selected: Option<String>,
    /// Session shown for the focused agent.
    pub focused_session: usize,
    /// Agents being created, with their latest status.
    pub pending: BTreeMap<String, AgentStatus>,
    /// Worktrees available for reuse.
    pub worktrees: Vec<WorktreeInfo>,
    /// Profile names.
    pub profiles: Vec<String>,
    /// Pairing code on display.
    pub connection_code: Option<PairingCode>,
    /// Pairing failure on display.
    pub connection_error: Option<String>,
    /// Last error sent to this client.
    pub last_error: Option<String>,
    /// Last requested screen, by agent and session.
    pub screen: Option<(String, usize, ScreenSnapshot)>,
}

impl MirrorState {
    /// Agent record by key.
    pub fn agent(&self, key: &str) -> Option<&AgentInfo> {
        self.agents.iter().find(|a| a.key == key)
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.key == key)
    }

    fn apply(&mut self, op: MirrorOp) {
        match op {
            MirrorOp::ClearPending { agent_key } => {
                self.pending.remove(&agent_key);
            }
            MirrorOp::UpsertAgent(info) => match self.position(&info.key) {
                Some(i) => self.agents[i] = info,
                None => self.agents.push(info),
            },
            MirrorOp::FocusAgent { agent_key } => {
                if self.position(&agent_key).is_some() {
                    self.selected = Some(agent_key);
                    self.focused_session = 0;
                }
            }
            MirrorOp::SetFocus { agent_key, session } => {
                self.selected = agent_key.filter(|k| self.position(k).is_some());
                self.focused_session = if self.selected.is_some() { session } else { 0 };
            }
            MirrorOp::RemoveAgent { agent_key } => {
                self.pending.remove(&agent_key);
                let Some(idx) = self.position(&agent_key) else {
                    return;
                };
                self.agents.remove(idx);
                if self.selected.as_deref() == Some(agent_key.as_str()) {
                    self.selected = self
                        .agents
                        .get(idx)
                        .or_else(|| self.agents.last())
                        .map(|a| a.key.clone());
                    self.focused_session = 0;
                }
            }
            MirrorOp::SetStatus { agent_key, status } => match self.position(&agent_key) {
                Some(i) => self.agents[i].status = status,
                None => {
                    self.pending.insert(agent_key, status);
                }
            },
            MirrorOp::ReplaceAgents { agents, focused } => {
                self.pending.retain(|k, _| !agents.iter().any(|a| &a.key == k));
                self.agents = agents;
                if self.selected != focused {
                    self.focused_session = 0;
                }
                self.selected = focused.filter(|k| self.agents.iter().any(|a| &a.key == k));
            }
            MirrorOp::ReplaceWorktrees(worktrees) => self.worktrees = worktrees,
            MirrorOp::ReplaceProfiles(profiles) => self.profiles = profiles,
            MirrorOp::SetConnectionCode(code) => {
                self.connection_code = code;
                self.connection_error = None;
            }
            MirrorOp::SetConnectionError(error) => {
                self.connection_code = None;
                self.connection_error = Some(error);
            }
            MirrorOp::SetError(message) => self.last_error = Some(message),
            MirrorOp::StoreScreen {
                agent_key,
                session,
                snapshot,
            } => self.screen = Some((agent_key, session, snapshot)),
        }
    }

    /// Agent-set changes `op` would make: 1 for a new key or a removed existing key.
    fn structural_delta(&self, op: &MirrorOp) -> u64 {
        match op {
            MirrorOp::UpsertAgent(info) => u64::from(self.position(&info.key).is_none()),
            MirrorOp::RemoveAgent { agent_key } => u64::from(self.position(agent_key).is_some()),
            _ => 0,
        }
    }
}

/// Mirror with ordering and generation checks.
#[derive(Debug, Clone, Default)]
pub struct ClientMirror {
    state: MirrorState,
    last_seq: Option<u64>,
    generation: u64,
    needs_resync: bool,
}

impl ClientMirror {
    /// Empty mirror expecting its first event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> &MirrorState {
        &self.state
    }

    /// Sequence number of the last applied batch.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Hub generation the mirror is at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the mirror is waiting for a snapshot.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// Applies one batch, all or nothing.
    pub fn apply(&mut self, batch: OpBatch) -> Result<(), MirrorError> {
        if batch.snapshot {
            for op in batch.ops {
                self.state.apply(op);
            }
            self.last_seq = Some(batch.seq);
            self.generation = batch.generation;
            self.needs_resync = false;
            return Ok(());
        }

        if self.needs_resync {
            return Err(MirrorError::AwaitingResync);
        }
        let expected_seq = self.last_seq.map_or(1, |s| s + 1);
        if batch.seq != expected_seq {
            self.needs_resync = true;
            return Err(MirrorError::SequenceGap {
                expected: expected_seq,
                got: batch.seq,
            });
        }
        let structural: u64 = batch
            .ops
            .iter()
            .map(|op| self.state.structural_delta(op))
            .sum();
        let expected_generation = self.generation + structural;
        if batch.generation != expected_generation {
            self.needs_resync = true;
            return Err(MirrorError::GenerationGap {
                expected: expected_generation,
                got: batch.generation,
            });
        }

        for op in batch.ops {
            self.state.apply(op);
        }
        self.last_seq = Some(batch.seq);
        self.generation = batch.generation;
        Ok(())
    }

    /// Translates and applies one envelope.
    pub fn apply_envelope(&mut self, envelope: &EventEnvelope) -> Result<(), MirrorError> {
        self.apply(OpBatch::from_envelope(envelope))
    }

    /// Moves the local session view; not Hub state.
    pub fn focus_session(&mut self, index: usize) {
        self.state.focused_session = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    struct Stream {
        seq: u64,
        generation: u64,
    }

    impl Stream {
        fn new() -> Self {
            Self { seq: 0, generation: 0 }
        }

        fn next(&mut self, event: HubEvent) -> EventEnvelope {
            self.seq += 1;
            match &event {
                HubEvent::AgentCreated { .. } => self.generation += 1,
                HubEvent::AgentDeleted { .. } => self.generation += 1,
                _ => {}
            }
            EventEnvelope {
                seq: self.seq,
                generation: self.generation,
                event,
            }
        }
    }

    fn info(branch: &str) -> AgentInfo {
        let mut info = Agent::new("repo", "/tmp/repo", branch, "default").info();
        info.status = AgentStatus::Running;
        info
    }

    fn status(key: &str, status: AgentStatus) -> HubEvent {
        HubEvent::AgentStatusChanged {
            agent_key: key.into(),
            status,
        }
    }

    #[test]
    fn test_creating_marker_then_created() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();

        mirror
            .apply_envelope(&stream.next(status("repo-a", AgentStatus::CreatingWorktree)))
            .unwrap();
        assert_eq!(
            mirror.state().pending.get("repo-a"),
            Some(&AgentStatus::CreatingWorktree)
        );
        mirror
            .apply_envelope(&stream.next(status("repo-a", AgentStatus::SpawningSessions)))
            .unwrap();
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentCreated {
                agent: info("a"),
                focus: true,
            }))
            .unwrap();

        let state = mirror.state();
        assert!(state.pending.is_empty());
        assert_eq!(state.agents.len(), 1);
        assert_eq!(state.selected.as_deref(), Some("repo-a"));
        assert_eq!(mirror.generation(), 1);
    }

    #[test]
    fn test_status_replay_is_idempotent() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentCreated {
                agent: info("a"),
                focus: false,
            }))
            .unwrap();

        let event = status("repo-a", AgentStatus::Stopping);
        mirror.apply_envelope(&stream.next(event.clone())).unwrap();
        let once = mirror.state().clone();
        mirror.apply_envelope(&stream.next(event)).unwrap();
        assert_eq!(mirror.state(), &once);
    }

    #[test]
    fn test_status_touches_only_status() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        let mut a = info("a");
        a.metadata.insert("x".into(), serde_json::json!(1));
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentCreated { agent: a.clone(), focus: false }))
            .unwrap();
        mirror
            .apply_envelope(&stream.next(status("repo-a", AgentStatus::Stopping)))
            .unwrap();

        let mut expected = a;
        expected.status = AgentStatus::Stopping;
        assert_eq!(mirror.state().agent("repo-a"), Some(&expected));
    }

    #[test]
    fn test_out_of_order_batch_refused() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        let first = stream.next(status("k", AgentStatus::CreatingWorktree));
        let second = stream.next(status("k", AgentStatus::SpawningSessions));

        assert_eq!(
            mirror.apply_envelope(&second),
            Err(MirrorError::SequenceGap { expected: 1, got: 2 })
        );
        assert!(mirror.needs_resync());
        assert_eq!(mirror.apply_envelope(&first), Err(MirrorError::AwaitingResync));
        assert!(mirror.state().pending.is_empty());
    }

    #[test]
    fn test_generation_gap_requires_resync() {
        let mut mirror = ClientMirror::new();
        let envelope = EventEnvelope {
            seq: 1,
            generation: 5,
            event: HubEvent::AgentCreated { agent: info("a"), focus: false },
        };
        assert_eq!(
            mirror.apply_envelope(&envelope),
            Err(MirrorError::GenerationGap { expected: 1, got: 5 })
        );
        assert!(mirror.state().agents.is_empty());

        let snapshot = EventEnvelope {
            seq: 9,
            generation: 5,
            event: HubEvent::AgentList {
                agents: vec![info("a"), info("b")],
                focused: Some("repo-b".into()),
            },
        };
        mirror.apply_envelope(&snapshot).unwrap();
        assert!(!mirror.needs_resync());
        assert_eq!(mirror.last_seq(), Some(9));
        assert_eq!(mirror.generation(), 5);
        assert_eq!(mirror.state().selected.as_deref(), Some("repo-b"));

        let next = EventEnvelope {
            seq: 10,
            generation: 6,
            event: HubEvent::AgentDeleted { agent_key: "repo-a".into() },
        };
        mirror.apply_envelope(&next).unwrap();
        assert_eq!(mirror.state().agents.len(), 1);
    }

    #[test]
    fn test_delete_moves_focus_next_then_previous() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        for b in ["a", "b", "c"] {
            mirror
                .apply_envelope(&stream.next(HubEvent::AgentCreated { agent: info(b), focus: b == "b" }))
                .unwrap();
        }
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentDeleted { agent_key: "repo-b".into() }))
            .unwrap();
        assert_eq!(mirror.state().selected.as_deref(), Some("repo-c"));
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentDeleted { agent_key: "repo-c".into() }))
            .unwrap();
        assert_eq!(mirror.state().selected.as_deref(), Some("repo-a"));
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentDeleted { agent_key: "repo-a".into() }))
            .unwrap();
        assert_eq!(mirror.state().selected, None);
    }

    #[test]
    fn test_focus_change_follows_hub() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        for b in ["a", "b"] {
            mirror
                .apply_envelope(&stream.next(HubEvent::AgentCreated { agent: info(b), focus: true }))
                .unwrap();
        }
        assert_eq!(mirror.state().selected.as_deref(), Some("repo-b"));

        mirror
            .apply_envelope(&stream.next(HubEvent::FocusChanged {
                agent_key: Some("repo-a".into()),
                session: 1,
            }))
            .unwrap();
        assert_eq!(mirror.state().selected.as_deref(), Some("repo-a"));
        assert_eq!(mirror.state().focused_session, 1);
        assert_eq!(mirror.generation(), 2);

        mirror
            .apply_envelope(&stream.next(HubEvent::FocusChanged {
                agent_key: Some("repo-gone".into()),
                session: 0,
            }))
            .unwrap();
        assert_eq!(mirror.state().selected, None);
    }

    #[test]
    fn test_failed_spawn_marker_removed_without_generation_change() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        mirror
            .apply_envelope(&stream.next(status("k", AgentStatus::Failed("no pty".into()))))
            .unwrap();
        // The Hub never inserted the agent, so deletion carries the same generation.
        let envelope = EventEnvelope {
            seq: 2,
            generation: 0,
            event: HubEvent::AgentDeleted { agent_key: "k".into() },
        };
        mirror.apply_envelope(&envelope).unwrap();
        assert!(mirror.state().pending.is_empty());
        assert_eq!(mirror.generation(), 0);
    }

    #[test]
    fn test_upsert_of_existing_agent_is_not_structural() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        mirror
            .apply_envelope(&stream.next(HubEvent::AgentCreated { agent: info("a"), focus: false }))
            .unwrap();
        let mut updated = info("a");
        updated.metadata.insert("pr".into(), serde_json::json!(12));
        let envelope = EventEnvelope {
            seq: 2,
            generation: 1,
            event: HubEvent::AgentCreated { agent: updated.clone(), focus: false },
        };
        mirror.apply_envelope(&envelope).unwrap();
        assert_eq!(mirror.state().agent("repo-a"), Some(&updated));
    }

    #[test]
    fn test_collections_and_codes_replace() {
        let mut stream = Stream::new();
        let mut mirror = ClientMirror::new();
        mirror
            .apply_envelope(&stream.next(HubEvent::Profiles { profiles: vec!["a".into(), "b".into()] }))
            .unwrap();
        mirror
            .apply_envelope(&stream.next(HubEvent::Profiles { profiles: vec!["c".into()] }))
            .unwrap();
        assert_eq!(mirror.state().profiles, vec!["c"]);

        mirror
            .apply_envelope(&stream.next(HubEvent::ConnectionCodeError { error: "no server".into() }))
            .unwrap();
        let code = PairingCode { url: "https://x".into(), code: "ABCD".into() };
        mirror
            .apply_envelope(&stream.next(HubEvent::ConnectionCode { pairing: Some(code.clone()) }))
            .unwrap();
        assert_eq!(mirror.state().connection_code, Some(code));
        assert_eq!(mirror.state().connection_error, None);
        mirror
            .apply_envelope(&stream.next(HubEvent::ConnectionCode { pairing: None }))
            .unwrap();
        assert_eq!(mirror.state().connection_code, None);
    }
}
