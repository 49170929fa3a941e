use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use openraft::{Config, LogId, RaftMetrics, ServerState, SnapshotPolicy};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::election::{Leadership, Tracker};
use crate::error::HarnessError;
use crate::fsm::{Counters, Fsm, NoopFsm};
use crate::invariant;
use crate::network::{Milestone, Network};
use crate::store::{create_store, Member, MemberId, MemStore, RigRaft};

/// Knobs for cluster bootstrap. The defaults keep elections fully scripted
/// (no member ever campaigns on its own) and retain a single trailing log
/// after snapshots so a lagging follower must restore.
pub struct ClusterOptions {
    pub heartbeat_millis: u64,
    pub election_timeout_millis: (u64, u64),
    pub default_timeout: Duration,
    pub trailing_logs: u64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            heartbeat_millis: 50,
            election_timeout_millis: (150, 300),
            default_timeout: Duration::from_secs(5),
            trailing_logs: 1,
        }
    }
}

/// Bootstraps an n-member consensus cluster wired through fault-injecting
/// transports, all starting disconnected. Returns the member map and the
/// [`Control`] handle used to script the test.
pub async fn cluster(n: usize) -> Result<(BTreeMap<MemberId, RigRaft>, Control)> {
    cluster_with(n, ClusterOptions::default(), |_| {
        Box::new(NoopFsm::default()) as Box<dyn Fsm>
    })
    .await
}

/// Like [`cluster`], with explicit options and a per-member state-machine
/// factory.
pub async fn cluster_with(
    n: usize,
    opts: ClusterOptions,
    fsm_factory: impl Fn(MemberId) -> Box<dyn Fsm>,
) -> Result<(BTreeMap<MemberId, RigRaft>, Control)> {
    let config = Config {
        cluster_name: "raft-rig".to_string(),
        heartbeat_interval: opts.heartbeat_millis,
        election_timeout_min: opts.election_timeout_millis.0,
        election_timeout_max: opts.election_timeout_millis.1,
        // Elections happen only when the harness triggers them.
        enable_tick: true,
        enable_elect: false,
        enable_heartbeat: true,
        snapshot_policy: SnapshotPolicy::Never,
        max_in_snapshot_log_to_keep: opts.trailing_logs,
        ..Default::default()
    };
    let config = Arc::new(config.validate()?);

    let mut network = Network::new();
    let ids: Vec<MemberId> = (0..n as MemberId).collect();
    for id in &ids {
        network.add(*id);
    }
    network.wire();

    let members: BTreeMap<MemberId, Member> =
        ids.iter().map(|id| (*id, Member::new(*id))).collect();

    let mut rafts = BTreeMap::new();
    let mut stores = BTreeMap::new();
    let mut counters = BTreeMap::new();
    for id in &ids {
        let member_counters = Counters::new();
        let (log_store, sm_store, store) =
            create_store(*id, fsm_factory(*id), member_counters.clone());
        let raft = RigRaft::new(
            *id,
            config.clone(),
            network.factory(*id),
            log_store,
            sm_store,
        )
        .await?;
        rafts.insert(*id, raft);
        stores.insert(*id, store);
        counters.insert(*id, member_counters);
    }
    network.install_targets(rafts.clone());

    // Every member starts from the same static membership; with all
    // transports disconnected none of them can reach a quorum yet.
    for raft in rafts.values() {
        raft.initialize(members.clone()).await?;
    }

    let mut tracker = Tracker::new();
    let mut streams = Vec::new();
    for (id, raft) in &rafts {
        let (tx, rx) = mpsc::channel(16);
        streams.push(tokio::spawn(leadership_stream(*id, raft.metrics(), tx)));
        tracker.track(*id, rx);
    }

    info!(members = n, "cluster bootstrapped, all transports disconnected");

    let (pending_tx, pending_rx) = watch::channel(0u32);
    let control = Control {
        inner: Arc::new(ControlInner {
            network,
            tracker: Mutex::new(tracker),
            rafts: rafts.clone(),
            stores,
            counters,
            current: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
            streams: Mutex::new(streams),
            pending_tx,
            pending_rx,
            default_timeout: opts.default_timeout,
            closed: AtomicBool::new(false),
        }),
    };

    Ok((rafts, control))
}

/// Folds a member's metrics stream into the raw leadership-notification
/// stream the notifier consumes: `true` on entering the leader state,
/// `false` on leaving it.
async fn leadership_stream(
    id: MemberId,
    mut metrics: watch::Receiver<RaftMetrics<MemberId, Member>>,
    tx: mpsc::Sender<bool>,
) {
    let mut was_leader = metrics.borrow().state == ServerState::Leader;
    loop {
        if metrics.changed().await.is_err() {
            return;
        }
        let is_leader = metrics.borrow().state == ServerState::Leader;
        if is_leader == was_leader {
            continue;
        }
        was_leader = is_leader;
        debug!(server = id, leader = is_leader, "leadership change observed");
        if tx.send(is_leader).await.is_err() {
            return;
        }
    }
}

#[derive(Clone)]
struct Reign {
    id: MemberId,
    leadership: Leadership,
}

#[derive(Clone, Copy)]
enum RuleAction {
    Depose,
    Snapshot,
}

struct ControlInner {
    network: Network,
    tracker: Mutex<Tracker>,
    rafts: BTreeMap<MemberId, RigRaft>,
    stores: BTreeMap<MemberId, MemStore>,
    counters: BTreeMap<MemberId, Counters>,
    current: Mutex<Option<Reign>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    streams: Mutex<Vec<JoinHandle<()>>>,
    pending_tx: watch::Sender<u32>,
    pending_rx: watch::Receiver<u32>,
    default_timeout: Duration,
    closed: AtomicBool,
}

impl ControlInner {
    fn raft(&self, id: MemberId) -> &RigRaft {
        self.rafts
            .get(&id)
            .unwrap_or_else(|| invariant!("server {id} is not registered"))
    }

    fn store(&self, id: MemberId) -> &MemStore {
        self.stores
            .get(&id)
            .unwrap_or_else(|| invariant!("server {id} is not registered"))
    }

    fn counters(&self, id: MemberId) -> &Counters {
        self.counters
            .get(&id)
            .unwrap_or_else(|| invariant!("server {id} is not registered"))
    }

    /// Disconnects a leader and forces it to relinquish leadership.
    ///
    /// An openraft leader cut off from its peers keeps considering itself
    /// leader; bumping it into a candidate term makes it step down and fail
    /// its pending client writes, which is the observable behavior of a
    /// deposed leader.
    async fn depose_member(&self, reign: &Reign) -> Result<(), HarnessError> {
        info!(server = reign.id, "deposing leader");
        self.network.deposing(reign.id);
        self.raft(reign.id)
            .trigger()
            .elect()
            .await
            .map_err(|e| HarnessError::Raft {
                id: reign.id,
                detail: e.to_string(),
            })?;

        let lost = tokio::time::timeout(self.default_timeout, reign.leadership.lost()).await;
        if lost.is_err() {
            return Err(HarnessError::DeposeTimeout {
                id: reign.id,
                timeout: self.default_timeout,
            });
        }
        info!(server = reign.id, "leadership lost");
        Ok(())
    }

    async fn depose_from_rule(&self, reign: &Reign) {
        if let Err(err) = self.depose_member(reign).await {
            warn!(server = reign.id, %err, "scripted deposition did not complete cleanly");
        }
        let mut current = self.current.lock().unwrap();
        if current.as_ref().map(|r| r.id) == Some(reign.id) {
            *current = None;
        }
    }

    /// Submits a snapshot request and returns the applied log id it should
    /// cover. Does not wait for the build; the caller decides when to.
    async fn start_snapshot(&self, id: MemberId) -> Option<LogId<MemberId>> {
        info!(server = id, "triggering snapshot");
        let raft = self.raft(id);
        let applied = raft.metrics().borrow().last_applied;
        if let Err(err) = raft.trigger().snapshot().await {
            warn!(server = id, %err, "snapshot trigger failed");
        }
        applied
    }

    async fn finish_snapshot(&self, id: MemberId, covers: Option<LogId<MemberId>>) {
        let wait = self
            .raft(id)
            .wait(Some(self.default_timeout))
            .metrics(move |m| m.snapshot >= covers, "scripted snapshot built")
            .await;
        if wait.is_err() {
            warn!(server = id, "snapshot did not complete in time");
        }
    }

    /// Single evaluation point for every scripted rule: arm the milestone's
    /// event, then watch it and perform the action.
    fn arm_rule(self: &Arc<Self>, reign: Reign, milestone: Milestone, count: u64, action: RuleAction) {
        let event = match milestone {
            Milestone::Enqueued | Milestone::Appended => {
                self.network.schedule_failure(reign.id, milestone, count)
            }
            Milestone::Committed => self.store(reign.id).schedule_commit_event(count),
        };

        self.pending_tx.send_modify(|pending| *pending += 1);
        let inner = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            event.watch().await;
            debug!(server = reign.id, ?milestone, count, "rule fired");
            match action {
                RuleAction::Depose => {
                    inner.depose_from_rule(&reign).await;
                    event.ack();
                }
                RuleAction::Snapshot => {
                    // Ack before waiting for the build: the apply path may be
                    // suspended on this very event, and the snapshot cannot
                    // be built until it resumes.
                    let covers = inner.start_snapshot(reign.id).await;
                    event.ack();
                    inner.finish_snapshot(reign.id, covers).await;
                }
            }
            inner.pending_tx.send_modify(|pending| *pending -= 1);
        });
        self.watchers.lock().unwrap().push(watcher);
    }
}

/// Scripting surface over a bootstrapped cluster.
pub struct Control {
    inner: Arc<ControlInner>,
}

impl Control {
    /// Connects `id` to all peers, triggers an election, and waits until the
    /// member has actually acquired leadership.
    pub async fn elect(&self, id: MemberId) -> Result<Term, HarnessError> {
        // A scripted rule mid-handshake may still be tearing down the
        // previous leader; the next election must not start under it.
        let mut pending = self.inner.pending_rx.clone();
        if tokio::time::timeout(self.inner.default_timeout, pending.wait_for(|p| *p == 0))
            .await
            .is_err()
        {
            invariant!("server {id}: election requested while a scripted rule is still pending");
        }

        let future = {
            let mut tracker = self.inner.tracker.lock().unwrap();
            tracker.expect(id, self.inner.default_timeout)
        };

        self.inner.network.electing(id);
        info!(server = id, "triggering election");
        self.inner
            .raft(id)
            .trigger()
            .elect()
            .await
            .map_err(|e| HarnessError::Raft {
                id,
                detail: e.to_string(),
            })?;

        let leadership = future.done().await?;
        info!(server = id, "leadership acquired");
        *self.inner.current.lock().unwrap() = Some(Reign {
            id,
            leadership: leadership.clone(),
        });

        Ok(Term {
            inner: self.inner.clone(),
            id,
            leadership,
        })
    }

    /// Immediately disconnects the current leader from all peers and waits
    /// for it to relinquish leadership.
    pub async fn depose(&self) -> Result<(), HarnessError> {
        let reign = self
            .inner
            .current
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| invariant!("no leadership is currently active"));
        self.inner.depose_member(&reign).await
    }

    /// Blocks until every armed rule has performed its action and every
    /// member reachable from the leader has applied everything the leader
    /// has logged. Members currently partitioned away are exempt: they have
    /// applied everything they know to be committed.
    pub async fn barrier(&self) -> Result<(), HarnessError> {
        let timeout = self.inner.default_timeout;

        let mut pending = self.inner.pending_rx.clone();
        if tokio::time::timeout(timeout, pending.wait_for(|p| *p == 0))
            .await
            .is_err()
        {
            return Err(HarnessError::BarrierTimeout { timeout });
        }

        let Some(reign) = self.inner.current.lock().unwrap().clone() else {
            return Ok(());
        };
        let target = self
            .inner
            .raft(reign.id)
            .metrics()
            .borrow()
            .last_log_index
            .unwrap_or(0);

        let mut members = vec![reign.id];
        members.extend(self.inner.network.transport(reign.id).connected_peers());
        for id in members {
            self.inner
                .raft(id)
                .wait(Some(timeout))
                .metrics(
                    move |m| m.last_applied.map(|l| l.index).unwrap_or(0) >= target,
                    "barrier",
                )
                .await
                .map_err(|_| HarnessError::BarrierTimeout { timeout })?;
        }
        Ok(())
    }

    /// Commands applied by a member's state machine.
    pub fn commands(&self, id: MemberId) -> u64 {
        self.inner.counters(id).commands()
    }

    /// Snapshots taken by a member.
    pub fn snapshots(&self, id: MemberId) -> u64 {
        self.inner.counters(id).snapshots()
    }

    /// Snapshot restores performed by a member.
    pub fn restores(&self, id: MemberId) -> u64 {
        self.inner.counters(id).restores()
    }

    pub fn network(&self) -> &Network {
        &self.inner.network
    }

    pub fn raft(&self, id: MemberId) -> &RigRaft {
        self.inner.raft(id)
    }

    /// Tears down the cluster: rule watchers, raft instances, notifiers and
    /// leadership streams. Safe to call from cleanup context and idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down cluster");

        for watcher in self.inner.watchers.lock().unwrap().drain(..) {
            watcher.abort();
        }
        for (id, raft) in &self.inner.rafts {
            if let Err(err) = raft.shutdown().await {
                warn!(server = *id, %err, "raft shutdown");
            }
        }
        self.inner.tracker.lock().unwrap().close();
        for stream in self.inner.streams.lock().unwrap().drain(..) {
            stream.abort();
        }
    }
}

/// Handle scoped to one leadership episode, returned by [`Control::elect`].
pub struct Term {
    inner: Arc<ControlInner>,
    id: MemberId,
    leadership: Leadership,
}

impl Term {
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Starts a fluent rule:
    /// `when().command(n).{enqueued,appended,committed}().{depose,snapshot}()`.
    pub fn when(&self) -> When {
        When {
            inner: self.inner.clone(),
            reign: Reign {
                id: self.id,
                leadership: self.leadership.clone(),
            },
        }
    }

    /// Cuts the link from this leader to `peer` for the rest of the term.
    pub fn disconnect(&self, peer: MemberId) {
        self.inner.network.disconnect(self.id, peer);
    }

    pub fn reconnect(&self, peer: MemberId) {
        self.inner.network.reconnect(self.id, peer);
    }

    /// Suspends until this leadership episode ends.
    pub async fn lost(&self) {
        self.leadership.lost().await;
    }
}

pub struct When {
    inner: Arc<ControlInner>,
    reign: Reign,
}

impl When {
    /// Selects the n-th client command replicated during this term.
    pub fn command(self, count: u64) -> Condition {
        Condition {
            inner: self.inner,
            reign: self.reign,
            count,
        }
    }
}

pub struct Condition {
    inner: Arc<ControlInner>,
    reign: Reign,
    count: u64,
}

impl Condition {
    /// The command is accepted locally by the leader, before replication.
    pub fn enqueued(self) -> Rule {
        self.at(Milestone::Enqueued)
    }

    /// The command is acknowledged as received by a follower.
    pub fn appended(self) -> Rule {
        self.at(Milestone::Appended)
    }

    /// The command is applied past quorum.
    pub fn committed(self) -> Rule {
        self.at(Milestone::Committed)
    }

    fn at(self, milestone: Milestone) -> Rule {
        Rule {
            inner: self.inner,
            reign: self.reign,
            count: self.count,
            milestone,
        }
    }
}

pub struct Rule {
    inner: Arc<ControlInner>,
    reign: Reign,
    count: u64,
    milestone: Milestone,
}

impl Rule {
    /// Deposes the leader when the milestone is reached.
    pub fn depose(self) {
        self.inner
            .arm_rule(self.reign, self.milestone, self.count, RuleAction::Depose);
    }

    /// Triggers the leader's snapshot when the milestone is reached.
    pub fn snapshot(self) {
        self.inner
            .arm_rule(self.reign, self.milestone, self.count, RuleAction::Snapshot);
    }
}
