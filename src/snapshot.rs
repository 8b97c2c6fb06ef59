//! Process snapshot and lookup contracts
//!
//! The limiter never walks the process table itself. It asks a
//! [`SnapshotProvider`] for the current members of the limited group every
//! cycle, and the supervisor asks a [`ProcessLookup`] to resolve the target
//! before the limiter starts. [`crate::procfs::ProcfsProvider`] implements
//! both on Linux.

use crate::member::Member;
use nix::unistd::Pid;
use thiserror::Error;

/// Errors returned when resolving a target process
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("No process found")]
    NotFound,

    #[error("Process {0} found but you aren't allowed to control it")]
    NotPermitted(Pid),

    #[error("Failed to read process table: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of group membership and per-member CPU usage
pub trait SnapshotProvider {
    /// Current members of the group rooted at `root`
    ///
    /// The root comes first. With `include_descendants` every live process
    /// whose ancestry reaches the root follows. Returns an empty list when
    /// the root is gone.
    fn enumerate_group(&mut self, root: Pid, include_descendants: bool) -> Vec<Member>;
}

/// One-shot target resolution used by the supervisor
pub trait ProcessLookup {
    /// Check that `pid` exists and can be signalled
    fn find_by_pid(&self, pid: Pid) -> Result<Pid, LookupError>;

    /// Find a process by executable name (basename) or path (contains `/`)
    fn find_by_executable(&self, name: &str) -> Result<Pid, LookupError>;
}
