use openraft::{Entry, EntryPayload};

use crate::store::{MemberId, TypeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Noop,
    Command,
    Membership,
}

impl LogKind {
    fn of(entry: &Entry<TypeConfig>) -> Self {
        match entry.payload {
            EntryPayload::Blank => LogKind::Noop,
            EntryPayload::Normal(_) => LogKind::Command,
            EntryPayload::Membership(_) => LogKind::Membership,
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogKind::Noop => "Noop",
            LogKind::Command => "Command",
            LogKind::Membership => "Membership",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedLog {
    pub term: u64,
    pub index: u64,
    pub kind: LogKind,
}

/// Record of the log entries sent to one destination member.
///
/// Only entries from the highest term observed so far are retained: an
/// append carrying a newer term models the peer's log being overwritten by a
/// higher-term leader, so everything older is dropped first.
#[derive(Debug, Clone)]
pub struct Peer {
    local: MemberId,
    target: MemberId,
    logs: Vec<TrackedLog>,
}

impl Peer {
    pub fn new(local: MemberId, target: MemberId) -> Self {
        Self {
            local,
            target,
            logs: Vec::new(),
        }
    }

    pub fn target(&self) -> MemberId {
        self.target
    }

    pub fn local(&self) -> MemberId {
        self.local
    }

    /// Merges newly observed entries, entry by entry and in order.
    /// Duplicates (same term and index) are skipped.
    pub fn update_logs(&mut self, entries: &[Entry<TypeConfig>]) {
        for entry in entries {
            let log = TrackedLog {
                term: entry.log_id.leader_id.term,
                index: entry.log_id.index,
                kind: LogKind::of(entry),
            };
            let max_term = self.logs.iter().map(|l| l.term).max().unwrap_or(0);
            if log.term > max_term {
                self.logs.clear();
            }
            if !self
                .logs
                .iter()
                .any(|l| l.term == log.term && l.index == log.index)
            {
                self.logs.push(log);
            }
        }
    }

    /// Number of tracked client-command entries. Noop entries inserted on
    /// leader election and membership entries are excluded.
    pub fn command_logs_count(&self) -> u64 {
        self.logs
            .iter()
            .filter(|l| l.kind == LogKind::Command)
            .count() as u64
    }

    /// The command count this peer would report after also receiving
    /// `entries`, without mutating the record.
    pub(crate) fn command_count_with(&self, entries: &[Entry<TypeConfig>]) -> u64 {
        let mut probe = self.clone();
        probe.update_logs(entries);
        probe.command_logs_count()
    }

    pub fn logs(&self) -> &[TrackedLog] {
        &self.logs
    }
}

/// Renders entries for debug traces, e.g.
/// `2 entries [Noop:term=1,index=1 Command:term=1,index=2]`.
pub(crate) fn describe_entries(entries: &[Entry<TypeConfig>]) -> String {
    match entries.len() {
        0 => "0 entries".to_string(),
        n => {
            let body = entries
                .iter()
                .map(|e| {
                    format!(
                        "{}:term={},index={}",
                        LogKind::of(e),
                        e.log_id.leader_id.term,
                        e.log_id.index
                    )
                })
                .collect::<Vec<_>>()
                .join(" ");
            let noun = if n == 1 { "entry" } else { "entries" };
            format!("{n} {noun} [{body}]")
        }
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, LogId};

    use super::*;

    fn entry(term: u64, index: u64, kind: LogKind) -> Entry<TypeConfig> {
        let payload = match kind {
            LogKind::Command => EntryPayload::Normal(Vec::new()),
            _ => EntryPayload::Blank,
        };
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(term, 0), index),
            payload,
        }
    }

    fn tracked(term: u64, index: u64, kind: LogKind) -> TrackedLog {
        TrackedLog { term, index, kind }
    }

    #[test]
    fn no_initial_logs_no_appended_logs() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[]);
        assert!(peer.logs().is_empty());
    }

    #[test]
    fn appended_logs_are_recorded() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Noop)]);
        assert_eq!(peer.logs(), &[tracked(1, 1, LogKind::Noop)]);
    }

    #[test]
    fn two_appended_logs_with_different_terms_keep_only_the_newer() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Noop), entry(2, 2, LogKind::Noop)]);
        assert_eq!(peer.logs(), &[tracked(2, 2, LogKind::Noop)]);
    }

    #[test]
    fn newer_term_discards_older_initial_logs() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Noop)]);
        peer.update_logs(&[entry(2, 2, LogKind::Noop)]);
        assert_eq!(peer.logs(), &[tracked(2, 2, LogKind::Noop)]);
    }

    #[test]
    fn duplicates_are_not_recorded_twice() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Noop)]);
        peer.update_logs(&[entry(1, 1, LogKind::Noop), entry(1, 2, LogKind::Command)]);
        assert_eq!(
            peer.logs(),
            &[tracked(1, 1, LogKind::Noop), tracked(1, 2, LogKind::Command)]
        );
    }

    #[test]
    fn only_command_logs_are_counted() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Noop), entry(1, 2, LogKind::Command)]);
        assert_eq!(peer.command_logs_count(), 1);
    }

    #[test]
    fn command_count_with_does_not_mutate() {
        let mut peer = Peer::new(0, 1);
        peer.update_logs(&[entry(1, 1, LogKind::Command)]);
        let probed = peer.command_count_with(&[entry(1, 2, LogKind::Command)]);
        assert_eq!(probed, 2);
        assert_eq!(peer.command_logs_count(), 1);
    }

    #[test]
    fn describe_entries_formats() {
        assert_eq!(describe_entries(&[]), "0 entries");
        assert_eq!(
            describe_entries(&[entry(1, 1, LogKind::Noop)]),
            "1 entry [Noop:term=1,index=1]"
        );
        assert_eq!(
            describe_entries(&[entry(1, 1, LogKind::Noop), entry(1, 2, LogKind::Command)]),
            "2 entries [Noop:term=1,index=1 Command:term=1,index=2]"
        );
    }
}
