//! Verbose control statistics
//!
//! Prints one row every [`ROW_INTERVAL`] cycles (never the first one) and
//! repeats the text header every [`HEADER_INTERVAL`] cycles.

use crate::cli::StatsFormat;
use crate::controller::CycleTiming;
use serde::Serialize;
use std::io::{self, Write};

pub const ROW_INTERVAL: u64 = 10;
pub const HEADER_INTERVAL: u64 = 200;

/// One reported control cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSample {
    pub cycle: u64,
    pub members: usize,
    pub cpu_percent: f64,
    pub work_us: u128,
    pub sleep_us: u128,
    pub active_rate_percent: f64,
}

impl CycleSample {
    pub fn new(cycle: u64, members: usize, timing: &CycleTiming) -> Self {
        Self {
            cycle,
            members,
            cpu_percent: timing.usage * 100.0,
            work_us: timing.work.as_micros(),
            sleep_us: timing.sleep.as_micros(),
            active_rate_percent: timing.working_rate * 100.0,
        }
    }
}

/// Writes cycle statistics when verbose mode is on
pub struct CycleReporter {
    enabled: bool,
    format: StatsFormat,
    out: Box<dyn Write + Send>,
}

impl std::fmt::Debug for CycleReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleReporter")
            .field("enabled", &self.enabled)
            .field("format", &self.format)
            .finish()
    }
}

impl CycleReporter {
    /// Reporter writing to stdout
    pub fn stdout(enabled: bool, format: StatsFormat) -> Self {
        Self::with_writer(enabled, format, Box::new(io::stdout()))
    }

    /// Reporter that never writes
    pub fn disabled() -> Self {
        Self::with_writer(false, StatsFormat::Text, Box::new(io::sink()))
    }

    pub fn with_writer(enabled: bool, format: StatsFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            enabled,
            format,
            out,
        }
    }

    pub fn record(&mut self, sample: &CycleSample) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let cycle = sample.cycle;
        match self.format {
            StatsFormat::Text => {
                if cycle % HEADER_INTERVAL == 0 {
                    writeln!(self.out, "\n%CPU\twork quantum\tsleep quantum\tactive rate")?;
                }
                if cycle % ROW_INTERVAL == 0 && cycle > 0 {
                    writeln!(
                        self.out,
                        "{:.2}%\t{:6} us\t{:6} us\t{:.2}%",
                        sample.cpu_percent,
                        sample.work_us,
                        sample.sleep_us,
                        sample.active_rate_percent
                    )?;
                }
            }
            StatsFormat::Json => {
                if cycle % ROW_INTERVAL == 0 && cycle > 0 {
                    let line = serde_json::to_string(sample).map_err(io::Error::other)?;
                    writeln!(self.out, "{}", line)?;
                }
            }
        }
        self.out.flush()
    }
}
