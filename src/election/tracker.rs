use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::election::notifier::{LeadershipFuture, Notifier, RequestStatus};
use crate::invariant;
use crate::store::MemberId;

/// Owns one [`Notifier`] per tracked member and serializes leadership
/// expectations: at most one outstanding request exists across the whole
/// cluster at a time.
///
/// Registration and observation are strictly ordered: all members are
/// tracked first, then `expect` may be called; tracking a member after the
/// first expectation is a contract violation.
pub struct Tracker {
    notifiers: HashMap<MemberId, Notifier>,
    last: Option<(MemberId, RequestStatus)>,
    observing: bool,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            notifiers: HashMap::new(),
            last: None,
            observing: false,
        }
    }

    /// Registers a member with its raw leadership-notification stream.
    pub fn track(&mut self, id: MemberId, notifications: mpsc::Receiver<bool>) {
        if self.observing {
            invariant!("can't track new server while observing");
        }
        if self.notifiers.contains_key(&id) {
            invariant!("an observer for server {id} is already registered");
        }
        self.notifiers.insert(id, Notifier::new(id, notifications));
    }

    /// Requests that `id` acquire leadership within `timeout`.
    pub fn expect(&mut self, id: MemberId, timeout: Duration) -> LeadershipFuture {
        self.observing = true;

        if let Some((last_id, status)) = &self.last {
            if status.outstanding() {
                invariant!("server {last_id} has already requested leadership");
            }
        }

        let notifier = self
            .notifiers
            .get(&id)
            .unwrap_or_else(|| invariant!("server {id} is not registered"));
        let future = notifier.acquired(timeout);
        self.last = Some((id, future.status()));
        future
    }

    /// Stops every notifier's watcher.
    pub fn close(&mut self) {
        for notifier in self.notifiers.values_mut() {
            notifier.close();
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
