//! Raise our own scheduling priority
//!
//! The limiter's timing only works if it is not itself starved by the
//! processes it throttles. We lower our nice value one step at a time down
//! to [`MAX_PRIORITY`] for as long as the kernel lets us.

use nix::errno::Errno;

/// Best nice value we try to reach
pub const MAX_PRIORITY: i32 = -10;

/// Result of [`raise_own_priority`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityChange {
    Raised { from: i32, to: i32 },
    Unchanged { level: i32 },
}

/// Step `current` down towards [`MAX_PRIORITY`] while `try_set` succeeds
pub fn raise_with<F>(current: i32, mut try_set: F) -> PriorityChange
where
    F: FnMut(i32) -> bool,
{
    let mut level = current;
    while level > MAX_PRIORITY && try_set(level - 1) {
        level -= 1;
    }
    if level == current {
        PriorityChange::Unchanged { level }
    } else {
        PriorityChange::Raised {
            from: current,
            to: level,
        }
    }
}

fn current_priority() -> i32 {
    // getpriority may legitimately return -1, so errno is the error signal
    Errno::clear();
    // SAFETY: plain syscall on our own process
    let level = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
    if level == -1 && Errno::last_raw() != 0 {
        0
    } else {
        level
    }
}

fn set_priority(level: i32) -> bool {
    // SAFETY: plain syscall on our own process
    unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, level) == 0 }
}

/// Best-effort priority boost; insufficient privilege is not an error
pub fn raise_own_priority() -> PriorityChange {
    raise_with(current_priority(), set_priority)
}
