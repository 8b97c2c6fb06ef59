//! Signal actuator: resume and suspend group members
//!
//! Delivery failure is the only death detection the limiter has. A member
//! whose signal cannot be delivered is evicted from the [`MemberSet`] before
//! the next usage aggregation, so dead processes never skew the controller.

use crate::member::MemberSet;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Something that can deliver a signal to a pid
pub trait SignalSender {
    fn send(&mut self, pid: Pid, signal: Signal) -> nix::Result<()>;
}

/// Delivers signals with `kill(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct KillSender;

impl SignalSender for KillSender {
    fn send(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        kill(pid, signal)
    }
}

/// Applies SIGCONT / SIGSTOP to every live member
#[derive(Debug)]
pub struct Actuator<S> {
    sender: S,
}

impl<S: SignalSender> Actuator<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Send SIGCONT to every member, evicting those that cannot receive it
    ///
    /// Returns the evicted pids.
    pub fn resume_all(&mut self, members: &mut MemberSet) -> Vec<Pid> {
        let targets = members.pids();
        self.deliver(members, targets, Signal::SIGCONT)
    }

    /// Send SIGSTOP to members whose usage exceeds `threshold`
    ///
    /// Members with unknown usage or usage at or below the threshold are
    /// left running. Returns the evicted pids.
    pub fn suspend_selected(&mut self, members: &mut MemberSet, threshold: f64) -> Vec<Pid> {
        let targets = members
            .iter()
            .filter(|m| m.exceeds(threshold))
            .map(|m| m.pid)
            .collect();
        self.deliver(members, targets, Signal::SIGSTOP)
    }

    /// Send SIGCONT to pids that left the member set
    ///
    /// They are no longer members, so a failed delivery only means the
    /// process is already gone.
    pub fn release(&mut self, pids: &[Pid]) {
        for &pid in pids {
            if let Err(errno) = self.sender.send(pid, Signal::SIGCONT) {
                tracing::debug!("Process {} left the group and is gone ({})", pid, errno);
            }
        }
    }

    fn deliver(&mut self, members: &mut MemberSet, targets: Vec<Pid>, signal: Signal) -> Vec<Pid> {
        let dead: Vec<Pid> = targets
            .into_iter()
            .filter(|&pid| match self.sender.send(pid, signal) {
                Ok(()) => false,
                Err(errno) => {
                    tracing::info!("{} failed. Process {} dead! ({})", signal, pid, errno);
                    true
                }
            })
            .collect();
        members.evict(&dead);
        dead
    }
}
