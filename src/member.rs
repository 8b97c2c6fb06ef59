//! Member and Member Set entities
//!
//! A [`MemberSet`] is the live collection of processes one limiter run is
//! throttling. It is refreshed from a process snapshot every cycle and shrunk
//! whenever a control signal fails to reach one of its members.

use nix::unistd::Pid;
use std::collections::HashSet;

/// One tracked process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Member {
    /// Process identifier
    pub pid: Pid,
    /// Smoothed CPU usage over the last sampling interval (fraction of one core).
    ///
    /// `None` until the snapshot provider has observed the process at least
    /// twice; `Some(0.0)` is a real observation of an idle process.
    pub cpu_usage: Option<f64>,
}

impl Member {
    /// Create a member with no usage observation yet
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            cpu_usage: None,
        }
    }

    /// Create a member with a known usage
    pub fn with_usage(pid: Pid, cpu_usage: f64) -> Self {
        Self {
            pid,
            cpu_usage: Some(cpu_usage),
        }
    }

    /// True if the member's usage is known and strictly above `threshold`
    pub fn exceeds(&self, threshold: f64) -> bool {
        matches!(self.cpu_usage, Some(usage) if usage > threshold)
    }
}

/// Ordered collection of members without duplicate pids
///
/// Evicted pids are tombstoned: a later snapshot that still reports them is
/// not allowed to re-admit them. The tombstone is cleared as soon as a
/// snapshot stops reporting the pid, so a recycled pid can join again later.
#[derive(Debug, Default)]
pub struct MemberSet {
    members: Vec<Member>,
    evicted: HashSet<Pid>,
}

impl MemberSet {
    /// Create an empty member set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a member set from a snapshot
    pub fn from_snapshot(snapshot: Vec<Member>) -> Self {
        let mut set = Self::new();
        set.apply_snapshot(snapshot);
        set
    }

    /// Replace the membership with the latest snapshot
    ///
    /// Snapshot order is preserved; duplicate pids keep their first entry.
    /// Returns the previous members the snapshot no longer reports. They
    /// may have been stopped during the last sleep slice, so the caller
    /// owes them a SIGCONT.
    pub fn apply_snapshot(&mut self, snapshot: Vec<Member>) -> Vec<Pid> {
        let reported: HashSet<Pid> = snapshot.iter().map(|m| m.pid).collect();
        self.evicted.retain(|pid| reported.contains(pid));

        let dropped = self
            .members
            .iter()
            .map(|m| m.pid)
            .filter(|pid| !reported.contains(pid))
            .collect();

        let mut seen = HashSet::with_capacity(snapshot.len());
        self.members = snapshot
            .into_iter()
            .filter(|m| !self.evicted.contains(&m.pid) && seen.insert(m.pid))
            .collect();
        dropped
    }

    /// Remove the given pids and tombstone them
    pub fn evict(&mut self, dead: &[Pid]) {
        if dead.is_empty() {
            return;
        }
        self.evicted.extend(dead.iter().copied());
        self.members.retain(|m| !dead.contains(&m.pid));
    }

    /// Sum of all known usages, or `None` if no member has been observed yet
    pub fn aggregate_usage(&self) -> Option<f64> {
        self.members
            .iter()
            .filter_map(|m| m.cpu_usage)
            .fold(None, |acc, usage| Some(acc.unwrap_or(0.0) + usage))
    }

    /// Pids in iteration order
    pub fn pids(&self) -> Vec<Pid> {
        self.members.iter().map(|m| m.pid).collect()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.members.iter().any(|m| m.pid == pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Member> {
        self.members.iter().find(|m| m.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
