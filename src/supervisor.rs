//! Target resolution and supervision
//!
//! Resolves the configured target to a pid, hands it to the [`Limiter`],
//! and decides what happens when the limited group disappears: command mode
//! reaps the child and mirrors its exit status, lazy mode exits, watch mode
//! looks for a new target every [`RETRY_INTERVAL`].

use crate::actuator::{KillSender, SignalSender};
use crate::cancel::CancellationToken;
use crate::clock::{Sleeper, ThreadSleeper};
use crate::config::{LimitConfig, Target};
use crate::controller::{LimitOutcome, Limiter};
use crate::diagnostics::CycleReporter;
use crate::priority::{raise_own_priority, PriorityChange};
use crate::procfs::ProcfsProvider;
use crate::snapshot::{LookupError, ProcessLookup, SnapshotProvider};
use anyhow::{bail, Context, Result};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};
use std::time::Duration;

/// Pause between two lookups in watch mode
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Exit status when the command cannot be started, as shells report it
pub const EXIT_SPAWN_FAILED: i32 = 127;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to exec {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Spawn { .. } => EXIT_SPAWN_FAILED,
        }
    }
}

/// Run the configured invocation and return the process exit status
pub fn run(config: LimitConfig, cancel: CancellationToken) -> Result<i32> {
    boost_priority(config.verbose);

    let reporter = CycleReporter::stdout(config.verbose, config.stats_format);
    let mut limiter = Limiter::new(
        ProcfsProvider::new(),
        KillSender,
        ThreadSleeper,
        config.control.clone(),
        cancel.clone(),
    )
    .with_reporter(reporter);

    match &config.target {
        Target::Command(command) => run_command(command, &mut limiter, config.verbose),
        target => watch(
            &ProcfsProvider::new(),
            &mut limiter,
            target,
            config.lazy,
            &cancel,
            RETRY_INTERVAL,
        ),
    }
}

fn boost_priority(verbose: bool) {
    match raise_own_priority() {
        PriorityChange::Raised { to, .. } => tracing::info!("Priority changed to {}", to),
        PriorityChange::Unchanged { level } => {
            if verbose {
                tracing::warn!(
                    "Cannot change priority (still {}). Run as root or renice for best results.",
                    level
                );
            }
        }
    }
}

/// Spawn `command`, limit it until it exits, and return its exit status
///
/// A command that cannot be started fails with [`CommandError::Spawn`].
/// A child killed by a signal maps to `128 + signo`. If we are cancelled
/// while the child is still running it is left running (and resumed) and
/// the status is 0.
pub fn run_command<P, S, C>(
    command: &[String],
    limiter: &mut Limiter<P, S, C>,
    verbose: bool,
) -> Result<i32>
where
    P: SnapshotProvider,
    S: SignalSender,
    C: Sleeper,
{
    let (program, args) = command.split_first().context("Command array is empty")?;
    if verbose {
        println!("Running command: '{}'", command.join(" "));
    }

    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
    let pid = Pid::from_raw(child.id() as i32);
    if verbose {
        println!("Limiting process {}", pid);
    }

    let report = limiter.run(pid);
    let status = match report.outcome {
        LimitOutcome::GroupExhausted => Some(child.wait().context("Failed to wait for child")?),
        LimitOutcome::Cancelled => child.try_wait().context("Failed to poll child")?,
    };

    Ok(status.map_or(0, |status| exit_code(pid, status, verbose)))
}

fn exit_code(pid: Pid, status: ExitStatus, verbose: bool) -> i32 {
    if let Some(code) = status.code() {
        if verbose {
            println!("Process {} terminated with exit status {}", pid, code);
        }
        return code;
    }
    println!("Process {} terminated abnormally", pid);
    status.signal().map_or(1, |signo| 128 + signo)
}

/// Find the target and limit it; repeat until lazy or cancelled
pub fn watch<L, P, S, C>(
    lookup: &L,
    limiter: &mut Limiter<P, S, C>,
    target: &Target,
    lazy: bool,
    cancel: &CancellationToken,
    retry: Duration,
) -> Result<i32>
where
    L: ProcessLookup,
    P: SnapshotProvider,
    S: SignalSender,
    C: Sleeper,
{
    let me = Pid::this();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let found = match target {
            Target::Pid(pid) => lookup.find_by_pid(*pid),
            Target::Executable(name) => lookup.find_by_executable(name),
            Target::Command(_) => bail!("Command targets are spawned, not looked up"),
        };

        match found {
            Ok(pid) if pid == me => bail!(
                "Target process {} is cpulimit itself! Aborting because it makes no sense",
                pid
            ),
            Ok(pid) => {
                println!("Process {} found", pid);
                if limiter.run(pid).outcome == LimitOutcome::Cancelled {
                    break;
                }
            }
            Err(LookupError::Io(e)) => tracing::warn!("Failed to look up target: {}", e),
            Err(e) => println!("{}", e),
        }

        if lazy || cancel.sleep(retry) {
            break;
        }
    }
    Ok(0)
}
