//! Validated limiter configuration
//!
//! [`crate::cli::Cli`] produces a [`LimitConfig`] after validation; the
//! limiter only ever sees the [`ControlSettings`] part of it.

use crate::cli::StatsFormat;
use nix::unistd::Pid;
use std::time::Duration;
use thiserror::Error;

/// Length of one control interval (work slice + sleep slice)
pub const DEFAULT_TIME_SLOT: Duration = Duration::from_millis(100);

/// Fatal configuration problems, reported before any target is touched
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("You must specify a cpu limit percentage")]
    MissingLimit,

    #[error("limit must be in the range 0-{max}")]
    LimitOutOfRange { max: u32 },

    #[error("minimum limited cpu must be in the range 0-{max}")]
    MinimumOutOfRange { max: u32 },

    #[error("Invalid value for argument PID")]
    InvalidPid(i32),

    #[error("You must specify one target process, either by name, pid, or command line")]
    NoTarget,

    #[error("You must specify exactly one target process, either by name, pid, or command line")]
    MultipleTargets,

    #[error("time slot must be greater than zero")]
    InvalidTimeSlot,
}

/// What to limit
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// An existing process
    Pid(Pid),
    /// The first process whose executable matches this name or path
    Executable(String),
    /// A command spawned and limited by us
    Command(Vec<String>),
}

impl Target {
    /// Pid and command targets cannot reappear once gone
    pub fn implies_lazy(&self) -> bool {
        matches!(self, Target::Pid(_) | Target::Command(_))
    }
}

/// Parameters of the duty-cycle controller
///
/// # Example
/// ```
/// use cpulimit::config::ControlSettings;
/// use std::time::Duration;
///
/// let settings = ControlSettings::new()
///     .with_limit(0.5)
///     .with_include_children(true)
///     .with_time_slot(Duration::from_millis(50));
/// assert_eq!(settings.limit, 0.5);
/// assert!(settings.include_children);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    /// Target usage as a fraction of one CPU (may exceed 1.0 on SMP)
    pub limit: f64,

    /// Track descendants of the target as well
    pub include_children: bool,

    /// Members at or below this usage fraction are never stopped
    pub minimum_limited_usage: f64,

    /// Control interval length
    pub time_slot: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            limit: 1.0,
            include_children: false,
            minimum_limited_usage: 0.0,
            time_slot: DEFAULT_TIME_SLOT,
        }
    }
}

impl ControlSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: f64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_include_children(mut self, include: bool) -> Self {
        self.include_children = include;
        self
    }

    pub fn with_minimum_limited_usage(mut self, minimum: f64) -> Self {
        self.minimum_limited_usage = minimum;
        self
    }

    pub fn with_time_slot(mut self, slot: Duration) -> Self {
        self.time_slot = slot;
        self
    }
}

/// Full configuration of one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct LimitConfig {
    pub control: ControlSettings,
    pub target: Target,
    /// Exit once the target group is gone instead of waiting for a new one
    pub lazy: bool,
    pub verbose: bool,
    pub stats_format: StatsFormat,
}

impl LimitConfig {
    /// Configuration for `target`; lazy if the target kind implies it
    pub fn new(target: Target, control: ControlSettings) -> Self {
        Self {
            lazy: target.implies_lazy(),
            control,
            target,
            verbose: false,
            stats_format: StatsFormat::Text,
        }
    }

    /// Request lazy mode; targets that imply it stay lazy
    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy || self.target.implies_lazy();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_stats_format(mut self, format: StatsFormat) -> Self {
        self.stats_format = format;
        self
    }
}

/// Number of online CPUs (at least 1)
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
