//! Linux `/proc` snapshot provider
//!
//! Reads `/proc/<pid>/stat` to build the limited group and to estimate each
//! member's recent CPU usage. Usage is derived from the growth of
//! `utime + stime` between two observations and smoothed with an
//! exponential moving average so that one noisy sampling window does not
//! whip the controller around.

use crate::member::Member;
use crate::snapshot::{LookupError, ProcessLookup, SnapshotProvider};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Weight of the newest sample in the usage moving average
pub const SMOOTHING_ALPHA: f64 = 0.08;

/// Observations closer together than this keep the previous estimate
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Kernel default upper bound on 64-bit systems
pub const DEFAULT_PID_MAX: i32 = 4_194_304;

/// Errors from parsing a `/proc/<pid>/stat` line
#[derive(Debug, Error, PartialEq)]
pub enum ProcfsError {
    #[error("stat line has no command name")]
    MissingComm,

    #[error("stat line is missing field {0}")]
    MissingField(&'static str),

    #[error("invalid {field} value: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// The fields of `/proc/<pid>/stat` the limiter cares about
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    /// User time in clock ticks
    pub utime: u64,
    /// System time in clock ticks
    pub stime: u64,
}

impl ProcStat {
    /// Zombies and dead tasks are not signalable members
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, 'Z' | 'X' | 'x')
    }

    pub fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }
}

/// Parse one `/proc/<pid>/stat` line
///
/// The command name is delimited by the first `(` and the last `)` because
/// it may itself contain spaces and parentheses.
///
/// # Example
/// ```
/// use cpulimit::procfs::parse_stat;
///
/// let stat = parse_stat("42 (my (app)) R 1 42 42 0 -1 0 0 0 0 0 150 30 0 0").unwrap();
/// assert_eq!(stat.comm, "my (app)");
/// assert_eq!(stat.ppid, 1);
/// assert_eq!(stat.cpu_ticks(), 180);
/// ```
pub fn parse_stat(line: &str) -> Result<ProcStat, ProcfsError> {
    let open = line.find('(').ok_or(ProcfsError::MissingComm)?;
    let close = line.rfind(')').ok_or(ProcfsError::MissingComm)?;
    if close < open {
        return Err(ProcfsError::MissingComm);
    }

    let pid = parse_field("pid", line[..open].trim())?;
    let comm = line[open + 1..close].to_string();

    let mut rest = line[close + 1..].split_whitespace();
    let state = rest
        .next()
        .and_then(|s| s.chars().next())
        .ok_or(ProcfsError::MissingField("state"))?;
    let ppid = parse_field("ppid", rest.next().ok_or(ProcfsError::MissingField("ppid"))?)?;

    // pgrp session tty_nr tpgid flags minflt cminflt majflt cmajflt
    let mut rest = rest.skip(9);
    let utime = parse_field("utime", rest.next().ok_or(ProcfsError::MissingField("utime"))?)?;
    let stime = parse_field("stime", rest.next().ok_or(ProcfsError::MissingField("stime"))?)?;

    Ok(ProcStat {
        pid,
        comm,
        state,
        ppid,
        utime,
        stime,
    })
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, ProcfsError> {
    value.parse().map_err(|_| ProcfsError::InvalidField {
        field,
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    cpu_ms: f64,
    at: Instant,
    usage: Option<f64>,
}

/// Per-pid smoothed CPU usage estimator
#[derive(Debug, Default)]
pub struct UsageTracker {
    samples: HashMap<Pid, Sample>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record cumulative CPU time for `pid` at `now` and return its usage
    ///
    /// The first observation of a pid returns `None`. The first measurable
    /// interval is taken as-is, later ones are blended in with
    /// [`SMOOTHING_ALPHA`].
    pub fn observe(&mut self, pid: Pid, cpu_ms: f64, now: Instant) -> Option<f64> {
        let Some(prev) = self.samples.get_mut(&pid) else {
            self.samples.insert(
                pid,
                Sample {
                    cpu_ms,
                    at: now,
                    usage: None,
                },
            );
            return None;
        };

        let elapsed = now.saturating_duration_since(prev.at);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return prev.usage;
        }

        let sample = (cpu_ms - prev.cpu_ms).max(0.0) / (elapsed.as_secs_f64() * 1000.0);
        let usage = match prev.usage {
            None => sample,
            Some(usage) => (1.0 - SMOOTHING_ALPHA) * usage + SMOOTHING_ALPHA * sample,
        };
        *prev = Sample {
            cpu_ms,
            at: now,
            usage: Some(usage),
        };
        Some(usage)
    }

    /// Forget every pid not in `live`
    pub fn retain(&mut self, live: &HashSet<Pid>) {
        self.samples.retain(|pid, _| live.contains(pid));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that `pid` exists and that we may signal it
pub fn probe(pid: Pid) -> Result<Pid, LookupError> {
    match kill(pid, None) {
        Ok(()) => Ok(pid),
        Err(Errno::EPERM) => Err(LookupError::NotPermitted(pid)),
        Err(_) => Err(LookupError::NotFound),
    }
}

/// Snapshot provider and process lookup backed by a procfs mount
#[derive(Debug)]
pub struct ProcfsProvider {
    root: PathBuf,
    ms_per_tick: f64,
    tracker: UsageTracker,
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProvider {
    /// Provider reading the system `/proc`
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Provider reading a procfs-shaped tree at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ms_per_tick: 1000.0 / clock_ticks_per_second(),
            tracker: UsageTracker::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn process_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Read and parse the stat file of one process
    pub fn read_stat(&self, pid: i32) -> Option<ProcStat> {
        let line = fs::read_to_string(self.process_dir(pid).join("stat")).ok()?;
        match parse_stat(&line) {
            Ok(stat) => Some(stat),
            Err(e) => {
                tracing::debug!("Skipping pid {}: {}", pid, e);
                None
            }
        }
    }

    /// Total CPU time (user + system) a process has consumed so far
    pub fn cpu_time(&self, pid: i32) -> Option<Duration> {
        let stat = self.read_stat(pid)?;
        let micros = stat.cpu_ticks() as f64 * self.ms_per_tick * 1000.0;
        Some(Duration::from_micros(micros.round() as u64))
    }

    /// Every readable process, zombies included, sorted by pid
    pub fn scan(&self) -> std::io::Result<Vec<ProcStat>> {
        let mut stats: Vec<ProcStat> = fs::read_dir(&self.root)?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter_map(|pid| self.read_stat(pid))
            .collect();
        stats.sort_by_key(|s| s.pid);
        Ok(stats)
    }

    /// Pids whose executable matches `name`, ascending, excluding ourselves
    ///
    /// A `name` containing `/` is compared with the full `argv[0]` (or the
    /// `exe` link); otherwise basenames are compared.
    pub fn matching_pids(&self, name: &str) -> std::io::Result<Vec<Pid>> {
        let by_path = name.contains('/');
        let me = Pid::this().as_raw();

        Ok(self
            .scan()?
            .into_iter()
            .filter(|s| s.is_alive() && s.pid != me)
            .filter(|s| self.executable_matches(s.pid, name, by_path))
            .map(|s| Pid::from_raw(s.pid))
            .collect())
    }

    fn executable_matches(&self, pid: i32, name: &str, by_path: bool) -> bool {
        let argv0 = self.argv0(pid);
        if by_path {
            argv0.as_deref() == Some(name)
                || fs::read_link(self.process_dir(pid).join("exe"))
                    .map(|exe| exe == Path::new(name))
                    .unwrap_or(false)
        } else {
            argv0.as_deref().map(basename) == Some(name)
        }
    }

    fn argv0(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.process_dir(pid).join("cmdline")).ok()?;
        let first = raw.split(|&b| b == 0).next()?;
        if first.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(first).into_owned())
    }

    /// Upper bound (exclusive) on valid pids, if the kernel exposes it
    pub fn pid_max(&self) -> Option<i32> {
        fs::read_to_string(self.root.join("sys/kernel/pid_max"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

fn is_descendant(parents: &HashMap<i32, i32>, pid: i32, root: i32) -> bool {
    let mut current = pid;
    // bounded walk; a corrupt table must not loop forever
    for _ in 0..=parents.len() {
        match parents.get(&current) {
            Some(&ppid) if ppid == root => return true,
            Some(&ppid) if ppid > 0 && ppid != current => current = ppid,
            _ => return false,
        }
    }
    false
}

impl SnapshotProvider for ProcfsProvider {
    fn enumerate_group(&mut self, root: Pid, include_descendants: bool) -> Vec<Member> {
        let now = Instant::now();
        let root_raw = root.as_raw();

        let stats = if include_descendants {
            self.scan().unwrap_or_else(|e| {
                tracing::debug!("Failed to scan {}: {}", self.root.display(), e);
                Vec::new()
            })
        } else {
            self.read_stat(root_raw).into_iter().collect()
        };

        let root_alive = stats.iter().any(|s| s.pid == root_raw && s.is_alive());
        if !root_alive {
            self.tracker.retain(&HashSet::new());
            return Vec::new();
        }

        let parents: HashMap<i32, i32> = stats.iter().map(|s| (s.pid, s.ppid)).collect();
        let group = stats.iter().filter(|s| s.pid == root_raw).chain(
            stats
                .iter()
                .filter(|s| s.pid != root_raw && s.is_alive())
                .filter(|s| include_descendants && is_descendant(&parents, s.pid, root_raw)),
        );

        let ms_per_tick = self.ms_per_tick;
        let members: Vec<Member> = group
            .map(|s| {
                let pid = Pid::from_raw(s.pid);
                Member {
                    pid,
                    cpu_usage: self
                        .tracker
                        .observe(pid, s.cpu_ticks() as f64 * ms_per_tick, now),
                }
            })
            .collect();

        let live: HashSet<Pid> = members.iter().map(|m| m.pid).collect();
        self.tracker.retain(&live);
        members
    }
}

impl ProcessLookup for ProcfsProvider {
    fn find_by_pid(&self, pid: Pid) -> Result<Pid, LookupError> {
        probe(pid)
    }

    fn find_by_executable(&self, name: &str) -> Result<Pid, LookupError> {
        let pid = self
            .matching_pids(name)?
            .into_iter()
            .next()
            .ok_or(LookupError::NotFound)?;
        probe(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stat_line(pid: i32, comm: &str, state: char, ppid: i32, utime: u64, stime: u64) -> String {
        format!(
            "{} ({}) {} {} {} 0 0 -1 4194560 0 0 0 0 {} {} 0 0 20 0 1 0 100 0 0\n",
            pid, comm, state, ppid, pid, utime, stime
        )
    }

    fn add_process(root: &Path, pid: i32, comm: &str, state: char, ppid: i32, argv0: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stat"), stat_line(pid, comm, state, ppid, 10, 5)).unwrap();
        fs::write(dir.join("cmdline"), format!("{}\0--flag\0", argv0)).unwrap();
    }

    /// 1 -> 100 -> 101 -> 102, 100 -> 103 (zombie), 1 -> 200
    fn fake_proc() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        add_process(root, 1, "init", 'S', 0, "/sbin/init");
        add_process(root, 100, "worker", 'R', 1, "/usr/bin/worker");
        add_process(root, 101, "child", 'S', 100, "./child");
        add_process(root, 102, "grandchild", 'R', 101, "/opt/grand child");
        add_process(root, 103, "dead", 'Z', 100, "");
        add_process(root, 200, "worker", 'S', 1, "worker");
        fs::create_dir_all(root.join("self")).unwrap();
        fs::create_dir_all(root.join("sys/kernel")).unwrap();
        fs::write(root.join("sys/kernel/pid_max"), "32768\n").unwrap();
        dir
    }

    fn pids(members: &[Member]) -> Vec<i32> {
        members.iter().map(|m| m.pid.as_raw()).collect()
    }

    #[test]
    fn test_parse_stat_fields() {
        let stat = parse_stat(&stat_line(4242, "cc1plus", 'R', 4000, 1234, 56)).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.comm, "cc1plus");
        assert_eq!(stat.state, 'R');
        assert_eq!(stat.ppid, 4000);
        assert_eq!(stat.utime, 1234);
        assert_eq!(stat.stime, 56);
        assert!(stat.is_alive());
    }

    #[test]
    fn test_parse_stat_comm_with_spaces_and_parens() {
        let stat = parse_stat(&stat_line(7, "a) (b c", 'S', 1, 3, 4)).unwrap();
        assert_eq!(stat.comm, "a) (b c");
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.cpu_ticks(), 7);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert_eq!(parse_stat("no parens here"), Err(ProcfsError::MissingComm));
        assert_eq!(parse_stat("12 (x)"), Err(ProcfsError::MissingField("state")));
        assert_eq!(
            parse_stat("12 (x) R 1 0 0"),
            Err(ProcfsError::MissingField("utime"))
        );
        assert!(matches!(
            parse_stat("abc (x) R 1"),
            Err(ProcfsError::InvalidField { field: "pid", .. })
        ));
    }

    #[test]
    fn test_cpu_time_sums_user_and_system() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        provider.ms_per_tick = 10.0;

        assert_eq!(provider.cpu_time(100), Some(Duration::from_millis(150)));
        assert_eq!(provider.cpu_time(999), None);
    }

    #[test]
    fn test_zombie_is_not_alive() {
        let stat = parse_stat(&stat_line(9, "z", 'Z', 1, 0, 0)).unwrap();
        assert!(!stat.is_alive());
    }

    #[test]
    fn test_enumerate_root_only() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        let members = provider.enumerate_group(Pid::from_raw(100), false);
        assert_eq!(pids(&members), vec![100]);
        assert_eq!(members[0].cpu_usage, None);
    }

    #[test]
    fn test_enumerate_with_descendants() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        let members = provider.enumerate_group(Pid::from_raw(100), true);
        assert_eq!(pids(&members), vec![100, 101, 102]);
    }

    #[test]
    fn test_enumerate_missing_root_is_empty() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        assert!(provider.enumerate_group(Pid::from_raw(999), true).is_empty());
        assert!(provider.enumerate_group(Pid::from_raw(999), false).is_empty());
    }

    #[test]
    fn test_enumerate_zombie_root_is_empty() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        assert!(provider.enumerate_group(Pid::from_raw(103), false).is_empty());
    }

    #[test]
    fn test_tracker_forgets_vanished_members() {
        let dir = fake_proc();
        let mut provider = ProcfsProvider::with_root(dir.path());
        provider.enumerate_group(Pid::from_raw(100), true);
        assert_eq!(provider.tracker.len(), 3);

        fs::remove_dir_all(dir.path().join("102")).unwrap();
        provider.enumerate_group(Pid::from_raw(100), true);
        assert_eq!(provider.tracker.len(), 2);
    }

    #[test]
    fn test_usage_tracker_smoothing() {
        let mut tracker = UsageTracker::new();
        let pid = Pid::from_raw(5);
        let t0 = Instant::now();

        assert_eq!(tracker.observe(pid, 1000.0, t0), None);
        // too soon to measure
        assert_eq!(tracker.observe(pid, 1005.0, t0 + Duration::from_millis(5)), None);

        let first = tracker
            .observe(pid, 1050.0, t0 + Duration::from_millis(100))
            .unwrap();
        assert!((first - 0.5).abs() < 1e-9);

        let second = tracker
            .observe(pid, 1150.0, t0 + Duration::from_millis(200))
            .unwrap();
        let expected = (1.0 - SMOOTHING_ALPHA) * 0.5 + SMOOTHING_ALPHA * 1.0;
        assert!((second - expected).abs() < 1e-9);

        // within the minimum interval the estimate is held
        assert_eq!(
            tracker.observe(pid, 1300.0, t0 + Duration::from_millis(210)),
            Some(second)
        );
    }

    #[test]
    fn test_usage_tracker_clamps_negative_progress() {
        let mut tracker = UsageTracker::new();
        let pid = Pid::from_raw(5);
        let t0 = Instant::now();
        tracker.observe(pid, 500.0, t0);
        let usage = tracker.observe(pid, 10.0, t0 + Duration::from_millis(100));
        assert_eq!(usage, Some(0.0));
    }

    #[test]
    fn test_matching_pids_by_basename() {
        let dir = fake_proc();
        let provider = ProcfsProvider::with_root(dir.path());
        let found: Vec<i32> = provider
            .matching_pids("worker")
            .unwrap()
            .into_iter()
            .map(Pid::as_raw)
            .collect();
        assert_eq!(found, vec![100, 200]);
    }

    #[test]
    fn test_matching_pids_by_path() {
        let dir = fake_proc();
        let provider = ProcfsProvider::with_root(dir.path());
        let found: Vec<i32> = provider
            .matching_pids("/usr/bin/worker")
            .unwrap()
            .into_iter()
            .map(Pid::as_raw)
            .collect();
        assert_eq!(found, vec![100]);

        let spaced: Vec<i32> = provider
            .matching_pids("/opt/grand child")
            .unwrap()
            .into_iter()
            .map(Pid::as_raw)
            .collect();
        assert_eq!(spaced, vec![102]);
    }

    #[test]
    fn test_find_by_executable_not_found() {
        let dir = fake_proc();
        let provider = ProcfsProvider::with_root(dir.path());
        assert!(matches!(
            provider.find_by_executable("nonexistent"),
            Err(LookupError::NotFound)
        ));
    }

    #[test]
    fn test_pid_max() {
        let dir = fake_proc();
        let provider = ProcfsProvider::with_root(dir.path());
        assert_eq!(provider.pid_max(), Some(32768));

        let empty = TempDir::new().unwrap();
        assert_eq!(ProcfsProvider::with_root(empty.path()).pid_max(), None);
    }

    #[test]
    fn test_probe_self_succeeds() {
        let me = Pid::this();
        assert_eq!(probe(me).unwrap(), me);
    }
}
