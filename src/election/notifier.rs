use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::HarnessError;
use crate::invariant;
use crate::store::MemberId;

const WAITING: u8 = 0;
const ACQUIRED: u8 = 1;
const LOST: u8 = 2;
const TIMED_OUT: u8 = 3;

/// Where a leadership request currently stands. Shared between the future
/// handed to the caller, the notifier's watcher, and the [`Tracker`]'s
/// one-outstanding-request check.
///
/// [`Tracker`]: crate::election::Tracker
#[derive(Clone)]
pub(crate) struct RequestStatus(Arc<AtomicU8>);

impl RequestStatus {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WAITING)))
    }

    fn set(&self, state: u8) {
        self.0.store(state, Ordering::SeqCst);
    }

    fn try_timeout(&self) {
        let _ = self
            .0
            .compare_exchange(WAITING, TIMED_OUT, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Still waiting for acquisition, or holding an unlost leadership.
    pub(crate) fn outstanding(&self) -> bool {
        matches!(self.0.load(Ordering::SeqCst), WAITING | ACQUIRED)
    }
}

/// Handle to an acquired leadership episode.
#[derive(Clone, Debug)]
pub struct Leadership {
    id: MemberId,
    lost_rx: watch::Receiver<bool>,
}

impl Leadership {
    pub fn id(&self) -> MemberId {
        self.id
    }

    /// Suspends until the leadership ends. Idempotent: may be awaited any
    /// number of times, before or after the loss.
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }
}

/// One outstanding "became leader" request.
pub struct LeadershipFuture {
    id: MemberId,
    timeout: Duration,
    rx: oneshot::Receiver<Leadership>,
    status: RequestStatus,
}

impl LeadershipFuture {
    /// Suspends until leadership is acquired or the timeout elapses.
    pub async fn done(self) -> Result<Leadership, HarnessError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(leadership)) => Ok(leadership),
            Ok(Err(_)) => invariant!("server {}: leadership notifier closed", self.id),
            Err(_) => {
                self.status.try_timeout();
                Err(HarnessError::LeadershipTimeout {
                    id: self.id,
                    timeout: self.timeout,
                })
            }
        }
    }

    pub(crate) fn status(&self) -> RequestStatus {
        self.status.clone()
    }
}

struct Request {
    acquired: Option<oneshot::Sender<Leadership>>,
    status: RequestStatus,
}

struct Current {
    lost_tx: watch::Sender<bool>,
    status: RequestStatus,
}

/// Sequential processing of one member's leadership notifications. Acquired
/// and lost must strictly alternate; anything else is an impossible sequence
/// from the consensus library or a misuse of the harness, and fails loudly.
struct NotifierCore {
    id: MemberId,
    pending: Option<Request>,
    current: Option<Current>,
}

impl NotifierCore {
    fn new(id: MemberId) -> Self {
        Self {
            id,
            pending: None,
            current: None,
        }
    }

    fn handle_request(&mut self, request: Request) {
        if self.pending.is_some() {
            invariant!("server {}: duplicate leadership request", self.id);
        }
        self.pending = Some(request);
    }

    fn handle_notification(&mut self, acquired: bool) {
        if acquired {
            self.handle_acquired();
        } else {
            self.handle_lost();
        }
    }

    fn handle_acquired(&mut self) {
        if self.current.is_some() {
            invariant!("server {} acquired leadership twice in a row", self.id);
        }
        let Some(mut request) = self.pending.take() else {
            invariant!("server {}: unexpected leadership change", self.id);
        };
        let Some(tx) = request.acquired.take() else {
            invariant!(
                "server {}: duplicate leadership acquired notification",
                self.id
            );
        };

        let (lost_tx, lost_rx) = watch::channel(false);
        request.status.set(ACQUIRED);
        if tx
            .send(Leadership {
                id: self.id,
                lost_rx,
            })
            .is_err()
        {
            debug!(server = self.id, "leadership acquired after requester gave up");
        }
        self.current = Some(Current {
            lost_tx,
            status: request.status,
        });
    }

    fn handle_lost(&mut self) {
        let Some(current) = self.current.take() else {
            invariant!("server {}: unexpected leadership loss", self.id);
        };
        current.status.set(LOST);
        let _ = current.lost_tx.send(true);
    }
}

/// Adapts one member's raw leadership-notification stream (`true` on
/// acquisition, `false` on loss) into an async request/response contract.
pub struct Notifier {
    id: MemberId,
    requests: mpsc::UnboundedSender<Request>,
    watcher: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn new(id: MemberId, notifications: mpsc::Receiver<bool>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(run(NotifierCore::new(id), requests_rx, notifications));
        Self {
            id,
            requests: requests_tx,
            watcher: Some(watcher),
        }
    }

    /// Arms exactly one pending leadership request and returns its future
    /// immediately.
    pub fn acquired(&self, timeout: Duration) -> LeadershipFuture {
        let (tx, rx) = oneshot::channel();
        let status = RequestStatus::new();
        if self
            .requests
            .send(Request {
                acquired: Some(tx),
                status: status.clone(),
            })
            .is_err()
        {
            invariant!("server {}: leadership notifier closed", self.id);
        }
        LeadershipFuture {
            id: self.id,
            timeout,
            rx,
            status,
        }
    }

    /// Stops the watcher; notifications arriving afterwards are not
    /// processed.
    pub fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    mut core: NotifierCore,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut notifications: mpsc::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            request = requests.recv() => match request {
                Some(request) => core.handle_request(request),
                None => return,
            },
            notification = notifications.recv() => match notification {
                Some(acquired) => core.handle_notification(acquired),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The invariant-violation paths are exercised directly on the core; the
    // happy paths go through the public surface in tests/notifier_test.rs.

    fn request() -> Request {
        let (tx, _rx) = oneshot::channel();
        Request {
            acquired: Some(tx),
            status: RequestStatus::new(),
        }
    }

    #[test]
    #[should_panic(expected = "server 0: unexpected leadership change")]
    fn acquired_without_pending_request_panics() {
        let mut core = NotifierCore::new(0);
        core.handle_notification(true);
    }

    #[test]
    #[should_panic(expected = "server 0 acquired leadership twice in a row")]
    fn two_acquired_in_a_row_panics() {
        let mut core = NotifierCore::new(0);
        core.handle_request(request());
        core.handle_notification(true);
        core.handle_notification(true);
    }

    #[test]
    #[should_panic(expected = "server 0: duplicate leadership request")]
    fn duplicate_request_panics() {
        let mut core = NotifierCore::new(0);
        core.handle_request(request());
        core.handle_request(request());
    }

    #[test]
    #[should_panic(expected = "server 0: duplicate leadership acquired notification")]
    fn resolving_an_already_resolved_future_panics() {
        let mut core = NotifierCore::new(0);
        core.handle_request(Request {
            acquired: None,
            status: RequestStatus::new(),
        });
        core.handle_notification(true);
    }

    #[test]
    #[should_panic(expected = "server 0: unexpected leadership loss")]
    fn lost_without_active_leadership_panics() {
        let mut core = NotifierCore::new(0);
        core.handle_notification(false);
    }

    #[test]
    fn acquired_then_lost_then_acquired_again() {
        let mut core = NotifierCore::new(0);
        core.handle_request(request());
        core.handle_notification(true);
        core.handle_notification(false);
        core.handle_request(request());
        core.handle_notification(true);
    }
}
