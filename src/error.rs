use std::time::Duration;

use crate::store::MemberId;

/// Errors produced by the harness itself.
///
/// Consensus-level errors (`ClientWriteError`, `RaftError`, ...) are never
/// wrapped in this type; they propagate to the caller untouched so tests can
/// assert on them verbatim.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The transport is not connected to the target member.
    #[error("cannot reach server {target}")]
    Unreachable { target: MemberId },

    /// Leadership was not acquired before the deadline.
    #[error("server {id}: leadership not acquired within {timeout:?}")]
    LeadershipTimeout { id: MemberId, timeout: Duration },

    /// Leadership was not relinquished before the deadline.
    #[error("server {id}: leadership not lost within {timeout:?}")]
    DeposeTimeout { id: MemberId, timeout: Duration },

    /// The cluster did not quiesce before the deadline.
    #[error("cluster did not quiesce within {timeout:?}")]
    BarrierTimeout { timeout: Duration },

    /// The consensus library reported a fatal condition on a control call.
    #[error("raft fatal error on server {id}: {detail}")]
    Raft { id: MemberId, detail: String },

    /// A harness contract was broken. Fatal: raised via [`invariant!`], never
    /// returned.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Aborts on a broken harness contract (a misused test script or an
/// impossible notification sequence from the consensus library). The panic
/// message is the rendered [`HarnessError::InvariantViolation`], so tests can
/// assert on it with `#[should_panic(expected = "...")]`.
#[macro_export]
macro_rules! invariant {
    ($($arg:tt)*) => {
        panic!(
            "{}",
            $crate::error::HarnessError::InvariantViolation(format!($($arg)*))
        )
    };
}
