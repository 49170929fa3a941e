use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::{Arc, Mutex};

use openraft::storage::{Adaptor, LogState, RaftStorage};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftLogReader, RaftSnapshotBuilder, Snapshot,
    SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fsm::{Counters, Fsm};
use crate::invariant;
use crate::network::Event;

pub type MemberId = u64;

/// Commands replicated through the cluster are opaque test payloads.
pub type Payload = Vec<u8>;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Payload,
        R = (),
        Node = Member,
);

pub type RigRaft = openraft::Raft<TypeConfig>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Member {
    pub name: String,
}

impl Member {
    pub fn new(id: MemberId) -> Self {
        Self {
            name: format!("member-{id}"),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Snapshot payload: the state machine's own bytes plus the command count at
/// the moment the snapshot was built, so a restored member reports the right
/// applied-command total.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBlob {
    commands: u64,
    state: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<MemberId, Member>,
    data: Vec<u8>,
}

struct ScheduledCommit {
    count: u64,
    event: Event,
}

#[derive(Default)]
struct MemLog {
    entries: BTreeMap<u64, Entry<TypeConfig>>,
    vote: Option<Vote<MemberId>>,
    last_purged: Option<LogId<MemberId>>,
}

struct MemStateMachine {
    last_applied: Option<LogId<MemberId>>,
    membership: StoredMembership<MemberId, Member>,
    fsm: Box<dyn Fsm>,
    snapshot: Option<StoredSnapshot>,
    snapshot_idx: u64,
}

/// In-memory log store and state machine for one cluster member.
///
/// The harness runs everything in-process, so there is nothing to persist;
/// the store instruments the apply/snapshot/restore paths with [`Counters`]
/// instead.
#[derive(Clone)]
pub struct MemStore {
    id: MemberId,
    log: Arc<Mutex<MemLog>>,
    sm: Arc<Mutex<MemStateMachine>>,
    counters: Counters,
    commit_gate: Arc<Mutex<Option<ScheduledCommit>>>,
}

impl MemStore {
    pub fn new(id: MemberId, fsm: Box<dyn Fsm>, counters: Counters) -> Self {
        Self {
            id,
            log: Arc::new(Mutex::new(MemLog::default())),
            sm: Arc::new(Mutex::new(MemStateMachine {
                last_applied: None,
                membership: StoredMembership::default(),
                fsm,
                snapshot: None,
                snapshot_idx: 0,
            })),
            counters,
            commit_gate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Arms a one-shot event that fires the instant the applied-command count
    /// reaches `count`. The apply path then suspends until the watcher
    /// acknowledges, so a `client_write` only resolves after the scripted
    /// action took effect. One armed event at a time.
    pub fn schedule_commit_event(&self, count: u64) -> Event {
        let mut gate = self.commit_gate.lock().unwrap();
        if let Some(scheduled) = gate.as_ref() {
            if !scheduled.event.is_acked() {
                invariant!("server {}: an event is already scheduled", self.id);
            }
        }
        let event = Event::new();
        *gate = Some(ScheduledCommit {
            count,
            event: event.clone(),
        });
        event
    }

    fn commit_event_reached(&self) -> Option<Event> {
        let gate = self.commit_gate.lock().unwrap();
        let scheduled = gate.as_ref()?;
        if scheduled.event.is_acked() {
            return None;
        }
        (self.counters.commands() >= scheduled.count).then(|| scheduled.event.clone())
    }
}

impl RaftLogReader<TypeConfig> for MemStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<MemberId>> {
        let log = self.log.lock().unwrap();
        Ok(log.entries.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for MemStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<MemberId>> {
        let mut sm = self.sm.lock().unwrap();

        let blob = SnapshotBlob {
            commands: self.counters.commands(),
            state: sm.fsm.snapshot(),
        };
        let data = serde_json::to_vec(&blob).map_err(|e| {
            StorageError::from_io_error(
                openraft::ErrorSubject::Snapshot(None),
                openraft::ErrorVerb::Write,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        sm.snapshot_idx += 1;
        let snapshot_id = format!(
            "{}-{}-{}",
            sm.last_applied
                .map(|l| l.leader_id.to_string())
                .unwrap_or_default(),
            sm.last_applied.map(|l| l.index).unwrap_or(0),
            sm.snapshot_idx
        );

        let meta = SnapshotMeta {
            last_log_id: sm.last_applied,
            last_membership: sm.membership.clone(),
            snapshot_id,
        };

        sm.snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });
        self.counters.record_snapshot();
        debug!(server = self.id, snapshot_id = %meta.snapshot_id, "snapshot built");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for MemStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<MemberId>> {
        let log = self.log.lock().unwrap();
        let last_log_id = log
            .entries
            .iter()
            .next_back()
            .map(|(_, e)| e.log_id)
            .or(log.last_purged);
        Ok(LogState {
            last_purged_log_id: log.last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<MemberId>) -> Result<(), StorageError<MemberId>> {
        self.log.lock().unwrap().vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<MemberId>>, StorageError<MemberId>> {
        Ok(self.log.lock().unwrap().vote)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<MemberId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut log = self.log.lock().unwrap();
        for entry in entries {
            log.entries.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<MemberId>,
    ) -> Result<(), StorageError<MemberId>> {
        let mut log = self.log.lock().unwrap();
        log.entries.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<MemberId>,
    ) -> Result<(), StorageError<MemberId>> {
        let mut log = self.log.lock().unwrap();
        log.last_purged = Some(log_id);
        log.entries = log.entries.split_off(&(log_id.index + 1));
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<MemberId>>,
            StoredMembership<MemberId, Member>,
        ),
        StorageError<MemberId>,
    > {
        let sm = self.sm.lock().unwrap();
        Ok((sm.last_applied, sm.membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<()>, StorageError<MemberId>> {
        let mut results = Vec::with_capacity(entries.len());
        {
            let mut sm = self.sm.lock().unwrap();
            for entry in entries {
                sm.last_applied = Some(entry.log_id);
                match &entry.payload {
                    EntryPayload::Blank => {}
                    EntryPayload::Normal(payload) => {
                        sm.fsm.apply(payload);
                        self.counters.record_apply();
                    }
                    EntryPayload::Membership(mem) => {
                        sm.membership = StoredMembership::new(Some(entry.log_id), mem.clone());
                    }
                }
                results.push(());
            }
        }

        // An armed commit event holds the apply path until its watcher has
        // performed the scripted action and acknowledged.
        if let Some(event) = self.commit_event_reached() {
            debug!(server = self.id, "commit event fired");
            event.fire();
            event.acked().await;
        }

        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<MemberId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<MemberId, Member>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<MemberId>> {
        let data = snapshot.into_inner();
        let blob: SnapshotBlob = serde_json::from_slice(&data).map_err(|e| {
            StorageError::from_io_error(
                openraft::ErrorSubject::Snapshot(Some(meta.signature())),
                openraft::ErrorVerb::Read,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        let mut sm = self.sm.lock().unwrap();
        sm.fsm.restore(&blob.state);
        sm.last_applied = meta.last_log_id;
        sm.membership = meta.last_membership.clone();
        sm.snapshot = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        self.counters.set_commands(blob.commands);
        self.counters.record_restore();
        debug!(server = self.id, snapshot_id = %meta.snapshot_id, "snapshot restored");

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<MemberId>> {
        let sm = self.sm.lock().unwrap();
        Ok(sm.snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

pub type MemLogStore = Adaptor<TypeConfig, MemStore>;
pub type MemStateMachineStore = Adaptor<TypeConfig, MemStore>;

/// Builds the log-store and state-machine handles for one member, the same
/// split the consensus library expects.
pub fn create_store(
    id: MemberId,
    fsm: Box<dyn Fsm>,
    counters: Counters,
) -> (MemLogStore, MemStateMachineStore, MemStore) {
    let store = MemStore::new(id, fsm, counters);
    let (log_store, sm_store) = Adaptor::new(store.clone());
    (log_store, sm_store, store)
}
