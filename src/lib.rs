//! cpulimit - limit the CPU usage of a process group
//!
//! This library provides the duty-cycle controller that throttles a target
//! process (and optionally its descendants) to a percentage of CPU by
//! alternately resuming and stopping it with SIGCONT/SIGSTOP, together with
//! the `/proc` snapshot provider, signal actuator and supervision loop the
//! `cpulimit` binary is built from.

pub mod actuator;
pub mod cancel;
pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod member;
pub mod priority;
pub mod procfs;
pub mod snapshot;
pub mod supervisor;
