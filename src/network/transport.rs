use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tracing::debug;

use crate::error::HarnessError;
use crate::invariant;
use crate::network::event::Event;
use crate::network::peers::{describe_entries, Peer, TrackedLog};
use crate::network::Milestone;
use crate::store::{Member, MemberId, RigRaft, TypeConfig};

/// Member-to-raft routing table. Populated once at bootstrap and read-only
/// afterwards, so concurrent lookups need no coordination beyond the lock.
#[derive(Clone, Default)]
pub(crate) struct Router {
    targets: Arc<RwLock<BTreeMap<MemberId, RigRaft>>>,
}

impl Router {
    pub(crate) fn install(&self, targets: BTreeMap<MemberId, RigRaft>) {
        *self.targets.write().unwrap() = targets;
    }

    fn target(&self, id: MemberId) -> RigRaft {
        self.targets
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| invariant!("server {id} is not registered"))
    }
}

struct ScheduledFailure {
    milestone: Milestone,
    count: u64,
    event: Event,
}

#[derive(Default)]
struct TransportState {
    peers: HashMap<MemberId, Peer>,
    connected: HashSet<MemberId>,
    scheduled: Option<ScheduledFailure>,
}

/// Fault-injecting transport for one cluster member.
///
/// To the consensus library it looks like an ordinary point-to-point
/// transport; underneath, every outbound RPC is gated on the connected-peer
/// set, append-entries traffic feeds the per-peer log trackers, and an armed
/// scheduled failure can interrupt the replication pipeline at an exact
/// command count.
///
/// Members start disconnected from everyone; `electing` must be called
/// before this member can reach its peers.
pub struct FaultTransport {
    id: MemberId,
    router: Router,
    state: Mutex<TransportState>,
}

impl FaultTransport {
    pub(crate) fn new(id: MemberId, router: Router) -> Self {
        Self {
            id,
            router,
            state: Mutex::new(TransportState::default()),
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub(crate) fn add_peer(&self, peer: MemberId) {
        let mut state = self.state.lock().unwrap();
        state.peers.insert(peer, Peer::new(self.id, peer));
    }

    /// Connects this member to all registered peers. Idempotent.
    pub fn electing(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = state.peers.keys().copied().collect();
        debug!(server = self.id, "transport connected to all peers");
    }

    /// Disconnects this member from all peers. An RPC already past the gate
    /// still completes its delivery; the failure shows up on the next send.
    pub fn deposing(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected.clear();
        debug!(server = self.id, "transport disconnected from all peers");
    }

    pub fn connect(&self, peer: MemberId) {
        let mut state = self.state.lock().unwrap();
        if !state.peers.contains_key(&peer) {
            invariant!("server {peer} is not registered");
        }
        state.connected.insert(peer);
    }

    pub fn disconnect(&self, peer: MemberId) {
        let mut state = self.state.lock().unwrap();
        if !state.peers.contains_key(&peer) {
            invariant!("server {peer} is not registered");
        }
        state.connected.remove(&peer);
    }

    pub fn is_connected(&self, peer: MemberId) -> bool {
        self.state.lock().unwrap().connected.contains(&peer)
    }

    pub fn connected_peers(&self) -> Vec<MemberId> {
        let state = self.state.lock().unwrap();
        let mut peers: Vec<_> = state.connected.iter().copied().collect();
        peers.sort_unstable();
        peers
    }

    /// True if at least one log entry reached `peer` during the current term.
    pub fn has_appended_logs_to(&self, peer: MemberId) -> bool {
        !self.tracked_logs(peer).is_empty()
    }

    /// Number of command entries that reached `peer` during the current term.
    pub fn commands_appended_to(&self, peer: MemberId) -> u64 {
        let state = self.state.lock().unwrap();
        self.peer(&state, peer).command_logs_count()
    }

    pub fn tracked_logs(&self, peer: MemberId) -> Vec<TrackedLog> {
        let state = self.state.lock().unwrap();
        self.peer(&state, peer).logs().to_vec()
    }

    fn peer<'a>(&self, state: &'a TransportState, peer: MemberId) -> &'a Peer {
        state
            .peers
            .get(&peer)
            .unwrap_or_else(|| invariant!("server {peer} is not registered"))
    }

    /// Arms a one-shot failure that fires when a peer's command count reaches
    /// `count` at the enqueue milestone.
    pub fn schedule_enqueue_failure(&self, count: u64) -> Event {
        self.schedule_failure(Milestone::Enqueued, count)
    }

    /// Arms a one-shot failure for a replication milestone. Only one event
    /// may be armed at a time; arming while a previous event has not been
    /// acknowledged is a contract violation.
    pub fn schedule_failure(&self, milestone: Milestone, count: u64) -> Event {
        if milestone == Milestone::Committed {
            invariant!(
                "server {}: commit milestones are observed on the state machine, not the transport",
                self.id
            );
        }
        let mut state = self.state.lock().unwrap();
        if let Some(scheduled) = &state.scheduled {
            if !scheduled.event.is_acked() {
                invariant!("server {}: an event is already scheduled", self.id);
            }
        }
        let event = Event::new();
        state.scheduled = Some(ScheduledFailure {
            milestone,
            count,
            event: event.clone(),
        });
        debug!(server = self.id, ?milestone, count, "failure event armed");
        event
    }

    /// The armed enqueue event, if delivering `entries` to `peer` would bring
    /// its command count to the threshold.
    fn armed_enqueue_event(
        &self,
        peer: MemberId,
        entries: &[openraft::Entry<TypeConfig>],
    ) -> Option<Event> {
        let state = self.state.lock().unwrap();
        let scheduled = state.scheduled.as_ref()?;
        if scheduled.milestone != Milestone::Enqueued || scheduled.event.is_acked() {
            return None;
        }
        let reached = self.peer(&state, peer).command_count_with(entries) >= scheduled.count;
        reached.then(|| scheduled.event.clone())
    }

    /// Records delivered entries against `peer` and returns the armed
    /// appended event if the tracker now meets its threshold.
    fn record_append(
        &self,
        peer: MemberId,
        entries: &[openraft::Entry<TypeConfig>],
    ) -> Option<Event> {
        let mut state = self.state.lock().unwrap();
        if !state.peers.contains_key(&peer) {
            invariant!("server {peer} is not registered");
        }
        let tracked = state.peers.get_mut(&peer).unwrap();
        tracked.update_logs(entries);
        let count = tracked.command_logs_count();

        let scheduled = state.scheduled.as_ref()?;
        if scheduled.milestone != Milestone::Appended || scheduled.event.is_acked() {
            return None;
        }
        (count >= scheduled.count).then(|| scheduled.event.clone())
    }

    fn unreachable<E: std::error::Error>(
        target: MemberId,
    ) -> RPCError<MemberId, Member, E> {
        RPCError::Network(NetworkError::new(&HarnessError::Unreachable { target }))
    }

    /// Sends an append-entries RPC to `target` through the fault gate.
    ///
    /// The gate is evaluated at call entry; once past it the delivery always
    /// completes, but the response only comes back if the link is still up
    /// when it arrives. That asymmetry models TCP: a follower can append
    /// entries whose acknowledgement the leader never sees.
    pub async fn append_entries(
        &self,
        target: MemberId,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> Result<AppendEntriesResponse<MemberId>, RPCError<MemberId, Member, RaftError<MemberId>>>
    {
        if let Some(event) = self.armed_enqueue_event(target, &req.entries) {
            debug!(server = self.id, to = target, "enqueue failure fired");
            event.fire();
            event.acked().await;
        }

        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }

        debug!(
            from = self.id,
            to = target,
            "append entries: {}",
            describe_entries(&req.entries)
        );
        let entries = req.entries.clone();
        let raft = self.router.target(target);
        let resp = raft
            .append_entries(req)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;

        if let Some(event) = self.record_append(target, &entries) {
            debug!(server = self.id, to = target, "appended failure fired");
            event.fire();
            event.acked().await;
        }

        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }
        Ok(resp)
    }

    pub async fn vote(
        &self,
        target: MemberId,
        req: VoteRequest<MemberId>,
    ) -> Result<VoteResponse<MemberId>, RPCError<MemberId, Member, RaftError<MemberId>>> {
        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }
        let raft = self.router.target(target);
        let resp = raft
            .vote(req)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }
        Ok(resp)
    }

    pub async fn install_snapshot(
        &self,
        target: MemberId,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> Result<
        InstallSnapshotResponse<MemberId>,
        RPCError<MemberId, Member, RaftError<MemberId, InstallSnapshotError>>,
    > {
        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }
        let raft = self.router.target(target);
        let resp = raft
            .install_snapshot(req)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        if !self.is_connected(target) {
            return Err(Self::unreachable(target));
        }
        Ok(resp)
    }
}

/// Per-member network factory handed to the consensus library. Clients are
/// thin handles onto the member's [`FaultTransport`].
#[derive(Clone)]
pub struct TransportFactory {
    transport: Arc<FaultTransport>,
}

impl TransportFactory {
    pub(crate) fn new(transport: Arc<FaultTransport>) -> Self {
        Self { transport }
    }
}

impl RaftNetworkFactory<TypeConfig> for TransportFactory {
    type Network = TransportClient;

    async fn new_client(&mut self, target: MemberId, _node: &Member) -> Self::Network {
        TransportClient {
            transport: self.transport.clone(),
            target,
        }
    }
}

pub struct TransportClient {
    transport: Arc<FaultTransport>,
    target: MemberId,
}

impl RaftNetwork<TypeConfig> for TransportClient {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<MemberId>, RPCError<MemberId, Member, RaftError<MemberId>>>
    {
        self.transport.append_entries(self.target, req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<MemberId>,
        RPCError<MemberId, Member, RaftError<MemberId, InstallSnapshotError>>,
    > {
        self.transport.install_snapshot(self.target, req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<MemberId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<MemberId>, RPCError<MemberId, Member, RaftError<MemberId>>> {
        self.transport.vote(self.target, req).await
    }
}
