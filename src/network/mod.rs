mod event;
mod peers;
mod transport;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use event::Event;
pub use peers::{LogKind, Peer, TrackedLog};
pub use transport::{FaultTransport, TransportClient, TransportFactory};

use crate::invariant;
use crate::store::{MemberId, RigRaft};

/// Replication milestone a scripted rule can key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    /// The leader hands the entry to the transport, before replication.
    Enqueued,
    /// A follower acknowledged receiving the entry.
    Appended,
    /// The entry was applied past quorum.
    Committed,
}

/// Registry owning one [`FaultTransport`] per cluster member, cross-wired so
/// RPCs between any two registered members route through their respective
/// transports. Constructed per test; there are no process-wide singletons.
pub struct Network {
    transports: BTreeMap<MemberId, Arc<FaultTransport>>,
    router: transport::Router,
}

impl Network {
    pub fn new() -> Self {
        Self {
            transports: BTreeMap::new(),
            router: transport::Router::default(),
        }
    }

    /// Registers a member and creates its transport.
    pub fn add(&mut self, id: MemberId) -> Arc<FaultTransport> {
        if self.transports.contains_key(&id) {
            invariant!("server {id} is already registered");
        }
        let transport = Arc::new(FaultTransport::new(id, self.router.clone()));
        self.transports.insert(id, transport.clone());
        transport
    }

    /// Cross-registers every pair of members as peers of each other. Called
    /// once after all members are added.
    pub fn wire(&self) {
        for (id, transport) in &self.transports {
            for peer in self.transports.keys() {
                if peer != id {
                    transport.add_peer(*peer);
                }
            }
        }
    }

    /// Installs the member-to-raft routing table. Bootstrap only; the table
    /// is read-only afterwards.
    pub(crate) fn install_targets(&self, targets: BTreeMap<MemberId, RigRaft>) {
        self.router.install(targets);
    }

    pub(crate) fn factory(&self, id: MemberId) -> TransportFactory {
        TransportFactory::new(self.transport(id))
    }

    pub fn electing(&self, id: MemberId) {
        self.get(id).electing();
    }

    pub fn deposing(&self, id: MemberId) {
        self.get(id).deposing();
    }

    pub fn disconnect(&self, id: MemberId, peer: MemberId) {
        self.get(id).disconnect(peer);
    }

    pub fn reconnect(&self, id: MemberId, peer: MemberId) {
        self.get(id).connect(peer);
    }

    pub fn schedule_enqueue_failure(&self, id: MemberId, count: u64) -> Event {
        self.get(id).schedule_enqueue_failure(count)
    }

    pub fn schedule_failure(&self, id: MemberId, milestone: Milestone, count: u64) -> Event {
        self.get(id).schedule_failure(milestone, count)
    }

    /// Direct access to a member's transport for inspection in assertions.
    pub fn transport(&self, id: MemberId) -> Arc<FaultTransport> {
        self.get(id).clone()
    }

    pub fn has_appended_logs_from_to(&self, from: MemberId, to: MemberId) -> bool {
        self.get(from).has_appended_logs_to(to)
    }

    fn get(&self, id: MemberId) -> &Arc<FaultTransport> {
        self.transports
            .get(&id)
            .unwrap_or_else(|| invariant!("server {id} is not registered"))
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}
