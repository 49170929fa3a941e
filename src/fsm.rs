use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A test state machine plugged into each cluster member.
///
/// Implementations only need to be deterministic; the harness instruments
/// every call through [`Counters`] regardless of what the machine does.
pub trait Fsm: Send + 'static {
    fn apply(&mut self, payload: &[u8]);
    fn snapshot(&self) -> Vec<u8>;
    fn restore(&mut self, data: &[u8]);
}

/// State machine that accumulates applied payloads and snapshots them as
/// JSON. The default for clusters that only care about the counters.
#[derive(Debug, Default)]
pub struct NoopFsm {
    applied: Vec<Vec<u8>>,
}

impl Fsm for NoopFsm {
    fn apply(&mut self, payload: &[u8]) {
        self.applied.push(payload.to_vec());
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.applied).expect("serialize fsm state")
    }

    fn restore(&mut self, data: &[u8]) {
        self.applied = serde_json::from_slice(data).unwrap_or_default();
    }
}

/// Monotonic per-member counters: commands applied, snapshots taken,
/// snapshots restored. This is the harness's observable test oracle.
///
/// The command counter is a watch channel so rule watchers can suspend until
/// the n-th command commits.
#[derive(Clone)]
pub struct Counters {
    commands_tx: Arc<watch::Sender<u64>>,
    commands_rx: watch::Receiver<u64>,
    snapshots: Arc<AtomicU64>,
    restores: Arc<AtomicU64>,
}

impl Counters {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = watch::channel(0);
        Self {
            commands_tx: Arc::new(commands_tx),
            commands_rx,
            snapshots: Arc::new(AtomicU64::new(0)),
            restores: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn commands(&self) -> u64 {
        *self.commands_rx.borrow()
    }

    pub fn snapshots(&self) -> u64 {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> u64 {
        self.restores.load(Ordering::SeqCst)
    }

    pub(crate) fn record_apply(&self) {
        self.commands_tx.send_modify(|c| *c += 1);
    }

    pub(crate) fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_restore(&self) {
        self.restores.fetch_add(1, Ordering::SeqCst);
    }

    /// Restore resets the command counter to the applied count carried by the
    /// snapshot, so `commands()` keeps meaning "commands applied to this
    /// member's state machine".
    pub(crate) fn set_commands(&self, count: u64) {
        self.commands_tx.send_replace(count);
    }

    /// Suspends until at least `count` commands have been applied.
    pub async fn wait_commands(&self, count: u64) {
        let mut rx = self.commands_rx.clone();
        let _ = rx.wait_for(|c| *c >= count).await;
    }

    /// Like [`Counters::wait_commands`], bounded by a deadline. Returns
    /// whether the count was reached.
    pub async fn wait_commands_timeout(&self, count: u64, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_commands(count))
            .await
            .is_ok()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let counters = Counters::new();
        assert_eq!(counters.commands(), 0);
        assert_eq!(counters.snapshots(), 0);
        assert_eq!(counters.restores(), 0);
    }

    #[test]
    fn counters_accumulate() {
        let counters = Counters::new();
        counters.record_apply();
        counters.record_apply();
        counters.record_snapshot();
        counters.record_restore();
        assert_eq!(counters.commands(), 2);
        assert_eq!(counters.snapshots(), 1);
        assert_eq!(counters.restores(), 1);
    }

    #[tokio::test]
    async fn wait_commands_resolves_when_count_reached() {
        let counters = Counters::new();
        let waiter = counters.clone();
        let handle = tokio::spawn(async move { waiter.wait_commands(2).await });
        counters.record_apply();
        counters.record_apply();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_commands_timeout_expires() {
        let counters = Counters::new();
        counters.record_apply();
        let reached = counters
            .wait_commands_timeout(2, Duration::from_millis(10))
            .await;
        assert!(!reached);
    }

    #[test]
    fn noop_fsm_snapshot_roundtrip() {
        let mut fsm = NoopFsm::default();
        fsm.apply(b"a");
        fsm.apply(b"b");
        let snap = fsm.snapshot();

        let mut other = NoopFsm::default();
        other.restore(&snap);
        assert_eq!(other.snapshot(), snap);
    }
}
