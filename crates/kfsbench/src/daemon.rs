//! Lifecycle of the storage daemon under test.
//!
//! ```text
//! Stopped ──cold_initialize──▶ Stopped (backing store reformatted)
//! Stopped ──start──▶ Initializing ──ready──▶ Ready ──reset counters──▶ Active
//! Active  ──stop──▶ Stopped
//! Active  ──(daemon dies)──▶ Crashed
//! ```
//!
//! The daemon is launched as a process-group leader so `stop` reaches every
//! wrapper and helper it runs under. Readiness is observed through an
//! identity file the daemon writes, cross-checked against the live process
//! tree so a file left behind by an earlier run is never mistaken for the
//! new daemon.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use kfsbench_proc::{
    command_line, run_captured, signal, spawn_group, CaptureOptions, CaptureOutcome, GroupChild,
    ProcessTree, Signal, SystemProcessTree, Termination,
};
use serde_json::{Map, Value};

use crate::config::IndexStructure;
use crate::env::TrialEnv;
use crate::error::{BenchError, Result};
use crate::stats::{ArtifactPattern, StatsCollector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Initializing,
    Ready,
    Active,
    Crashed,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// What the trial executor and sweep runner need from a daemon.
///
/// [`DaemonController`] is the real implementation; tests drive the runner
/// with scripted fakes.
pub trait Daemon {
    /// Reformat the backing store for `structure`. Stops a live daemon first.
    fn cold_initialize(&mut self, structure: IndexStructure, env: &TrialEnv) -> Result<()>;

    /// Launch and block until the daemon is serving with zeroed counters.
    fn start(&mut self, env: &TrialEnv) -> Result<()>;

    /// Stop the daemon's process group. A no-op (with a warning) when
    /// nothing is running.
    fn stop(&mut self) -> Result<()>;

    /// Non-blocking liveness check.
    fn is_active(&mut self) -> bool;

    fn state(&self) -> DaemonState;

    /// Structure the backing store was last formatted for.
    fn initialized_structure(&self) -> Option<IndexStructure>;

    /// Daemon-side counters gathered by the last `stop`, handed out once.
    fn take_daemon_stats(&mut self) -> Option<Map<String, Value>>;
}

/// Decides when a freshly launched daemon is serving.
pub trait ReadinessProbe {
    /// `launched` is the pid of the group leader the controller spawned.
    fn is_ready(&mut self, launched: u32) -> Result<bool>;
}

impl<F> ReadinessProbe for F
where
    F: FnMut(u32) -> Result<bool>,
{
    fn is_ready(&mut self, launched: u32) -> Result<bool> {
        self(launched)
    }
}

/// Ready once a pid file names the launched process or one of its
/// descendants.
#[derive(Debug, Clone)]
pub struct PidFileProbe {
    pattern: ArtifactPattern,
}

impl PidFileProbe {
    pub fn new(pattern: ArtifactPattern) -> Self {
        Self { pattern }
    }

    fn check(&self, launched: u32, tree: &dyn ProcessTree) -> Result<bool> {
        for file in self.pattern.list()? {
            let Ok(text) = fs::read_to_string(&file) else {
                continue;
            };
            let Ok(pid) = text.trim().parse::<u32>() else {
                tracing::debug!("Ignoring unreadable pid file {}", file.display());
                continue;
            };
            if tree.descends_from(pid, launched) {
                tracing::debug!("Daemon pid {} confirmed via {}", pid, file.display());
                return Ok(true);
            }
            tracing::debug!("Ignoring stale pid file {} (pid {})", file.display(), pid);
        }
        Ok(false)
    }
}

impl ReadinessProbe for PidFileProbe {
    fn is_ready(&mut self, launched: u32) -> Result<bool> {
        if self.pattern.list()?.is_empty() {
            return Ok(false);
        }
        self.check(launched, &SystemProcessTree::snapshot())
    }
}

/// How to format, launch and stop one daemon.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    /// Format command run by `cold_initialize`.
    pub format: Vec<String>,
    /// Daemon launch command.
    pub launch: Vec<String>,
    pub workdir: PathBuf,
    pub pid_files: ArtifactPattern,
    /// Daemon-side stats artifacts, harvested after every stop.
    pub stats: Option<ArtifactPattern>,
    /// Sent once ready to zero the daemon's counters.
    pub reset_signal: Option<Signal>,
    pub stop_signal: Signal,
    pub format_timeout: Duration,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    pub stop_timeout: Duration,
    /// Let the daemon write to the terminal instead of discarding output.
    pub echo: bool,
}

impl DaemonSpec {
    /// KernFS as laid out in a repository checked out at `root`.
    pub fn kernfs(root: &Path, numa_node: u32) -> Self {
        let dir = root.join("kernfs").join("tests");
        let path = |name: &str| dir.join(name).to_string_lossy().into_owned();
        let node = numa_node.to_string();

        Self {
            format: vec!["sudo".into(), "-E".into(), path("mkfs.sh")],
            launch: vec![
                path("run.sh"),
                "taskset".into(),
                "-c".into(),
                "0".into(),
                "numactl".into(),
                "-N".into(),
                node.clone(),
                "-m".into(),
                node,
                path("kernfs"),
            ],
            workdir: dir.clone(),
            pid_files: ArtifactPattern::kernfs_pid_files(),
            stats: Some(ArtifactPattern::kernfs_stats()),
            reset_signal: Some(Signal::SIGUSR2),
            stop_signal: Signal::SIGQUIT,
            format_timeout: Duration::from_secs(10 * 60),
            ready_timeout: Duration::from_secs(5 * 60),
            ready_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(10),
            echo: false,
        }
    }

    fn command(argv: &[String], workdir: &Path, env: &TrialEnv) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BenchError::config("empty daemon command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        env.apply(&mut cmd);
        Ok(cmd)
    }
}

/// Owns the single live daemon process, if any.
pub struct DaemonController {
    spec: DaemonSpec,
    probe: Box<dyn ReadinessProbe>,
    stats: Option<StatsCollector>,
    child: Option<GroupChild>,
    state: DaemonState,
    structure: Option<IndexStructure>,
    daemon_stats: Option<Map<String, Value>>,
    cold_inits: usize,
}

impl DaemonController {
    pub fn new(spec: DaemonSpec) -> Self {
        let probe = Box::new(PidFileProbe::new(spec.pid_files.clone()));
        let stats = spec
            .stats
            .clone()
            .map(|pattern| StatsCollector::new(pattern).primary_counter(None));
        Self {
            spec,
            probe,
            stats,
            child: None,
            state: DaemonState::Stopped,
            structure: None,
            daemon_stats: None,
            cold_inits: 0,
        }
    }

    /// Replace the pid-file readiness check.
    #[must_use]
    pub fn with_probe(mut self, probe: impl ReadinessProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    /// How many times the backing store has been formatted.
    pub fn cold_init_count(&self) -> usize {
        self.cold_inits
    }

    /// Pid of the running daemon's group leader.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(GroupChild::id)
    }

    /// Kill a daemon that never became ready.
    fn abandon(&mut self, mut child: GroupChild) {
        if let Err(e) = child.terminate(Signal::SIGKILL, self.spec.stop_timeout) {
            tracing::warn!("{}", BenchError::CleanupFailure(e.to_string()));
        }
        self.state = DaemonState::Stopped;
    }

    fn wait_until_ready(&mut self, child: &mut GroupChild) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.spec.ready_timeout;
        let launched = child.id();

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BenchError::DaemonCrashed(format!(
                    "exited with {status} before becoming ready"
                )));
            }
            if self.probe.is_ready(launched)? {
                tracing::debug!("Daemon ready after {:?}", started.elapsed());
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BenchError::DaemonStartTimeout {
                    waited: started.elapsed(),
                });
            }
            if signal::sleep_unless_shutdown(self.spec.ready_interval.min(deadline - now)) {
                return Err(BenchError::Interrupted);
            }
        }
    }

    fn harvest_daemon_stats(&mut self) {
        let Some(stats) = &self.stats else {
            return;
        };
        match stats.collect_latest() {
            Ok(Some(record)) => self.daemon_stats = Some(record),
            Ok(None) => tracing::warn!("Daemon left no statistics matching {}", stats.pattern()),
            Err(e) => tracing::warn!("Could not read daemon statistics: {}", e),
        }
    }
}

impl Daemon for DaemonController {
    fn cold_initialize(&mut self, structure: IndexStructure, env: &TrialEnv) -> Result<()> {
        if self.child.is_some() {
            tracing::warn!("Reformatting while the daemon is running; stopping it first");
            self.stop()?;
        }

        self.state = DaemonState::Initializing;
        let env = env.with_structure(structure);
        let mut cmd = DaemonSpec::command(&self.spec.format, &self.spec.workdir, &env)?;
        let line = command_line(&cmd);
        tracing::info!("Formatting backing store for {}", structure);

        let options = CaptureOptions {
            timeout: self.spec.format_timeout,
            echo: self.spec.echo,
            ..CaptureOptions::default()
        };
        let outcome = run_captured(&mut cmd, &options);
        self.state = DaemonState::Stopped;

        let reason = match outcome {
            Ok(CaptureOutcome::Exited(out)) if out.status.success() => {
                self.structure = Some(structure);
                self.cold_inits += 1;
                return Ok(());
            }
            Ok(CaptureOutcome::Exited(out)) => {
                format!("`{line}` exited with {}: {}", out.status, out.stderr.trim())
            }
            Ok(CaptureOutcome::TimedOut { elapsed, .. }) => {
                format!("`{line}` timed out after {elapsed:?}")
            }
            Err(e) => format!("`{line}`: {e}"),
        };
        self.structure = None;
        Err(BenchError::ColdInitFailed {
            structure: structure.to_string(),
            reason,
        })
    }

    fn start(&mut self, env: &TrialEnv) -> Result<()> {
        if self.child.is_some() {
            tracing::warn!("Starting the daemon without a clean stop of the previous one");
            self.stop()?;
        }
        if let Some(stats) = &self.stats {
            stats.pattern().purge()?;
        }
        self.daemon_stats = None;

        let mut cmd = DaemonSpec::command(&self.spec.launch, &self.spec.workdir, env)?;
        cmd.stdin(Stdio::null());
        if !self.spec.echo {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        tracing::debug!("Launching daemon: {}", command_line(&cmd));

        self.state = DaemonState::Initializing;
        let mut child = match spawn_group(&mut cmd) {
            Ok(child) => child,
            Err(e) => {
                self.state = DaemonState::Stopped;
                return Err(e.into());
            }
        };

        if let Err(e) = self.wait_until_ready(&mut child) {
            if matches!(e, BenchError::DaemonCrashed(_)) {
                self.state = DaemonState::Crashed;
                drop(child);
            } else {
                self.abandon(child);
            }
            return Err(e);
        }
        self.state = DaemonState::Ready;

        if let Some(reset) = self.spec.reset_signal {
            tracing::debug!("Resetting daemon counters with {}", reset);
            if let Err(e) = child.signal(reset) {
                self.abandon(child);
                return Err(e.into());
            }
        }

        self.child = Some(child);
        self.state = DaemonState::Active;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            tracing::warn!("Daemon stop requested while {}; nothing to do", self.state);
            return Ok(());
        };

        let exited_early = match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        };
        if let Some(status) = exited_early {
            tracing::warn!("Daemon had already exited ({}) before stop", status);
        }

        match child.terminate(self.spec.stop_signal, self.spec.stop_timeout) {
            Ok(Termination::Killed(_)) => {
                tracing::warn!("Daemon ignored {}; it was killed", self.spec.stop_signal);
            }
            Ok(_) => {}
            Err(e) => {
                self.state = DaemonState::Crashed;
                return Err(e.into());
            }
        }

        self.state = if exited_early.is_some() {
            DaemonState::Crashed
        } else {
            DaemonState::Stopped
        };
        self.harvest_daemon_stats();
        Ok(())
    }

    fn is_active(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn state(&self) -> DaemonState {
        self.state
    }

    fn initialized_structure(&self) -> Option<IndexStructure> {
        self.structure
    }

    fn take_daemon_stats(&mut self) -> Option<Map<String, Value>> {
        self.daemon_stats.take()
    }
}

impl Drop for DaemonController {
    fn drop(&mut self) {
        if self.child.is_some() {
            tracing::warn!("Stopping daemon left running");
            if let Err(e) = self.stop() {
                tracing::warn!("{}", BenchError::CleanupFailure(e.to_string()));
            }
        }
    }
}
