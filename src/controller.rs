//! Duty-cycle controller
//!
//! Every control interval (time slot) is split into a work slice, during
//! which all members run, and a sleep slice, during which members above the
//! exemption floor are stopped. The split follows a multiplicative feedback
//! on the measured group usage:
//!
//! ```text
//! working_rate' = min(working_rate / usage * limit, 1)
//! ```
//!
//! Scaling the previous duty cycle instead of recomputing it from scratch
//! keeps convergence smooth when per-cycle measurements are noisy.

use crate::actuator::{Actuator, SignalSender};
use crate::cancel::CancellationToken;
use crate::clock::Sleeper;
use crate::config::ControlSettings;
use crate::diagnostics::{CycleReporter, CycleSample};
use crate::member::MemberSet;
use crate::snapshot::SnapshotProvider;
use nix::unistd::Pid;
use std::time::Duration;

/// Work slices that overrun by more than this are logged
const OVERRUN_TOLERANCE: Duration = Duration::from_millis(10);

/// Timing decided for one control interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTiming {
    /// Aggregate usage the decision was based on (the limit when unknown)
    pub usage: f64,
    /// Duty cycle in [0, 1]
    pub working_rate: f64,
    pub work: Duration,
    pub sleep: Duration,
}

/// Feedback state carried across cycles
#[derive(Debug, Clone)]
pub struct DutyCycle {
    limit: f64,
    slot: Duration,
    working_rate: Option<f64>,
}

impl DutyCycle {
    pub fn new(limit: f64, slot: Duration) -> Self {
        Self {
            limit,
            slot,
            working_rate: None,
        }
    }

    pub fn working_rate(&self) -> Option<f64> {
        self.working_rate
    }

    pub fn slot(&self) -> Duration {
        self.slot
    }

    fn seed(&self) -> f64 {
        clamp_rate(self.limit).unwrap_or(0.0)
    }

    /// Compute the next work/sleep split from the group's aggregate usage
    ///
    /// Unknown usage (re)seeds the duty cycle with the limit. Zero usage
    /// leaves it unchanged.
    pub fn step(&mut self, aggregate_usage: Option<f64>) -> CycleTiming {
        let (rate, usage) = match aggregate_usage {
            None => (self.seed(), self.limit),
            Some(usage) => {
                let previous = self.working_rate.unwrap_or_else(|| self.seed());
                let corrected = if usage > 0.0 {
                    clamp_rate(previous / usage * self.limit).unwrap_or(previous)
                } else {
                    previous
                };
                (corrected, usage)
            }
        };
        self.working_rate = Some(rate);

        let work = self.slot.mul_f64(rate).min(self.slot);
        CycleTiming {
            usage,
            working_rate: rate,
            work,
            sleep: self.slot - work,
        }
    }
}

fn clamp_rate(rate: f64) -> Option<f64> {
    rate.is_finite().then(|| rate.clamp(0.0, 1.0))
}

/// Why a limiter run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    /// Every member is gone
    GroupExhausted,
    /// SIGINT/SIGTERM was received
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitReport {
    pub outcome: LimitOutcome,
    pub cycles: u64,
}

/// Throttles one process group until it disappears or we are cancelled
pub struct Limiter<P, S, C> {
    provider: P,
    actuator: Actuator<S>,
    sleeper: C,
    settings: ControlSettings,
    cancel: CancellationToken,
    reporter: CycleReporter,
}

impl<P, S, C> Limiter<P, S, C>
where
    P: SnapshotProvider,
    S: SignalSender,
    C: Sleeper,
{
    pub fn new(
        provider: P,
        sender: S,
        sleeper: C,
        settings: ControlSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            actuator: Actuator::new(sender),
            sleeper,
            settings,
            cancel,
            reporter: CycleReporter::disabled(),
        }
    }

    pub fn with_reporter(mut self, reporter: CycleReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn actuator(&self) -> &Actuator<S> {
        &self.actuator
    }

    pub fn sleeper(&self) -> &C {
        &self.sleeper
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Limit the group rooted at `root`
    ///
    /// Never fails: members that cannot be signalled are evicted. Whatever
    /// is still tracked when the loop ends gets a final SIGCONT so no member
    /// is left stopped.
    pub fn run(&mut self, root: Pid) -> LimitReport {
        let include = self.settings.include_children;
        let mut members =
            MemberSet::from_snapshot(self.provider.enumerate_group(root, include));
        tracing::info!(
            "Members in the process group owned by {}: {}",
            root,
            members.len()
        );

        let mut duty = DutyCycle::new(self.settings.limit, self.settings.time_slot);
        let mut cycle: u64 = 0;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break LimitOutcome::Cancelled;
            }
            if cycle > 0 {
                let snapshot = self.provider.enumerate_group(root, include);
                let departed = members.apply_snapshot(snapshot);
                self.actuator.release(&departed);
            }
            if members.is_empty() {
                tracing::info!("No more processes.");
                break LimitOutcome::GroupExhausted;
            }

            let timing = duty.step(members.aggregate_usage());
            if let Err(e) = self
                .reporter
                .record(&CycleSample::new(cycle, members.len(), &timing))
            {
                tracing::debug!("Failed to write cycle statistics: {}", e);
            }

            self.actuator.resume_all(&mut members);
            let worked = self.sleeper.sleep(timing.work);
            if cycle > 0 && worked > timing.work + OVERRUN_TOLERANCE {
                tracing::debug!(
                    "Cycle {}: work slice overran by {:?}",
                    cycle,
                    worked - timing.work
                );
            }

            if self.cancel.is_cancelled() {
                break LimitOutcome::Cancelled;
            }

            if !timing.sleep.is_zero() {
                self.actuator
                    .suspend_selected(&mut members, self.settings.minimum_limited_usage);
                self.sleeper.sleep(timing.sleep);
            }
            cycle += 1;
        };

        self.actuator.resume_all(&mut members);
        LimitReport {
            outcome,
            cycles: cycle,
        }
    }
}
