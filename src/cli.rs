//! CLI argument parsing for cpulimit

use crate::config::{ConfigError, ControlSettings, LimitConfig, Target};
use clap::{Parser, ValueEnum};
use nix::unistd::Pid;
use std::time::Duration;

/// Output format for verbose cycle statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatsFormat {
    /// Tab-separated table (default)
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "cpulimit")]
#[command(version)]
#[command(about = "Limit the CPU usage of a process (and optionally its children)")]
#[command(long_about = None)]
pub struct Cli {
    /// Percentage of CPU allowed, from 0 to 100 times the number of CPUs (required)
    #[arg(short = 'l', long = "limit", value_name = "N", allow_negative_numbers = true)]
    pub limit: Option<f64>,

    /// Pid of the process to limit (implies --lazy)
    #[arg(short = 'p', long = "pid", value_name = "N", allow_negative_numbers = true)]
    pub pid: Option<i32>,

    /// Name of the executable program file or path name
    #[arg(short = 'e', long = "exe", value_name = "FILE")]
    pub exe: Option<String>,

    /// Limit also the children processes
    #[arg(short = 'i', long = "include-children")]
    pub include_children: bool,

    /// Minimum CPU percentage a process must use before it gets stopped
    #[arg(
        short = 'm',
        long = "minimum-limited-cpu",
        value_name = "M",
        default_value = "0"
    )]
    pub minimum_limited_cpu: f64,

    /// Exit if there is no target process, or if it dies
    #[arg(short = 'z', long = "lazy")]
    pub lazy: bool,

    /// Show control statistics
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Length of one control interval in milliseconds
    #[arg(long = "time-slot", value_name = "MS", default_value = "100")]
    pub time_slot_ms: u64,

    /// Format of the control statistics shown with --verbose
    #[arg(long = "stats-format", value_enum, default_value = "text")]
    pub stats_format: StatsFormat,

    /// Run this command and limit it (implies --lazy)
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Validate the arguments against the machine's CPU count and pid range
    pub fn into_config(self, ncpu: usize, pid_max: i32) -> Result<LimitConfig, ConfigError> {
        let max_percent = 100 * ncpu.max(1) as u32;

        if let Some(pid) = self.pid {
            if pid <= 1 || pid >= pid_max {
                return Err(ConfigError::InvalidPid(pid));
            }
        }

        let percent = self.limit.ok_or(ConfigError::MissingLimit)?;
        if !(0.0..=max_percent as f64).contains(&percent) {
            return Err(ConfigError::LimitOutOfRange { max: max_percent });
        }
        if !(0.0..=max_percent as f64).contains(&self.minimum_limited_cpu) {
            return Err(ConfigError::MinimumOutOfRange { max: max_percent });
        }
        if self.time_slot_ms == 0 {
            return Err(ConfigError::InvalidTimeSlot);
        }

        let mut targets = Vec::new();
        if let Some(pid) = self.pid {
            targets.push(Target::Pid(Pid::from_raw(pid)));
        }
        if let Some(exe) = self.exe {
            targets.push(Target::Executable(exe));
        }
        if !self.command.is_empty() {
            targets.push(Target::Command(self.command));
        }
        let target = match targets.len() {
            0 => return Err(ConfigError::NoTarget),
            1 => targets.remove(0),
            _ => return Err(ConfigError::MultipleTargets),
        };

        let control = ControlSettings::new()
            .with_limit(percent / 100.0)
            .with_include_children(self.include_children)
            .with_minimum_limited_usage(self.minimum_limited_cpu / 100.0)
            .with_time_slot(Duration::from_millis(self.time_slot_ms));

        Ok(LimitConfig::new(target, control)
            .with_lazy(self.lazy)
            .with_verbose(self.verbose)
            .with_stats_format(self.stats_format))
    }
}
