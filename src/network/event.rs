use std::sync::Arc;

use tokio::sync::watch;

/// One-shot scheduled-failure event with an explicit two-phase handshake.
///
/// The arming side calls [`Event::fire`] when the trigger condition becomes
/// true and then suspends on [`Event::acked`]; the watcher suspends on
/// [`Event::watch`], performs its side effect, and calls [`Event::ack`] to
/// release everyone. Firing is irreversible and acknowledging clears the
/// armed slot that holds the event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    fired: watch::Sender<bool>,
    acked: watch::Sender<bool>,
}

impl Event {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        let (acked, _) = watch::channel(false);
        Self {
            inner: Arc::new(EventInner { fired, acked }),
        }
    }

    /// Marks the trigger condition reached. Idempotent: concurrent observers
    /// of the same condition may all report it.
    pub(crate) fn fire(&self) {
        self.inner.fired.send_replace(true);
    }

    /// Suspends until the event has fired.
    pub async fn watch(&self) {
        let mut rx = self.inner.fired.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Acknowledges the event, releasing every task suspended on
    /// [`Event::acked`]. The watcher must only call this after completing its
    /// side effect.
    pub fn ack(&self) {
        self.inner.acked.send_replace(true);
    }

    /// Suspends until the watcher has acknowledged.
    pub(crate) async fn acked(&self) {
        let mut rx = self.inner.acked.subscribe();
        let _ = rx.wait_for(|acked| *acked).await;
    }

    pub fn is_fired(&self) -> bool {
        *self.inner.fired.borrow()
    }

    pub fn is_acked(&self) -> bool {
        *self.inner.acked.borrow()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
