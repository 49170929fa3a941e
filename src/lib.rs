pub mod control;
pub mod election;
pub mod error;
pub mod fsm;
pub mod network;
pub mod store;

pub use control::{cluster, cluster_with, ClusterOptions, Control, Term};
pub use election::{Leadership, LeadershipFuture, Notifier, Tracker};
pub use error::HarnessError;
pub use fsm::{Counters, Fsm, NoopFsm};
pub use network::{Event, FaultTransport, LogKind, Milestone, Network, TrackedLog};
pub use store::{MemStore, Member, MemberId, Payload, RigRaft, TypeConfig};
