//! Process-group leaders and bounded, escalating termination.
//!
//! Every child the harness launches becomes the leader of a fresh process
//! group, so helpers it forks (`run.sh` wrappers, `numactl`, `taskset`) are
//! signaled together with it. Waits are always bounded: a group that
//! survives `SIGKILL` is reported as [`ProcError::Unkillable`] instead of
//! hanging the sweep.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::ProcError;

/// How often bounded waits re-check the child.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a group gets to disappear after `SIGKILL`.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Render a command as a shell-like line for logs.
pub fn command_line(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Send `signal` to every process in group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pgid: Pid, signal: Signal) -> Result<bool, ProcError> {
    match killpg(pgid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(ProcError::Signal {
            pgid: pgid.as_raw(),
            signal,
            errno,
        }),
    }
}

/// Whether any process (zombies included) still belongs to group `pgid`.
pub fn group_alive(pgid: Pid) -> bool {
    match killpg(pgid, None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Spawn `cmd` as the leader of a new process group.
pub fn spawn_group(cmd: &mut Command) -> Result<GroupChild, ProcError> {
    cmd.process_group(0);
    let program = cmd.get_program().to_string_lossy().into_owned();

    let child = cmd.spawn().map_err(|source| {
        if source.kind() == io::ErrorKind::PermissionDenied {
            ProcError::PermissionDenied { program: program.clone() }
        } else {
            ProcError::Spawn { program: program.clone(), source }
        }
    })?;

    // pid_t is i32 on every unix target; child pids always fit.
    #[allow(clippy::cast_possible_wrap)]
    let pgid = Pid::from_raw(child.id() as i32);
    tracing::debug!("Spawned {} as group leader {}", program, pgid);

    Ok(GroupChild {
        child,
        pgid,
        status: None,
    })
}

/// How a group ended under [`GroupChild::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The leader had already exited before any signal was sent.
    AlreadyExited(ExitStatus),
    /// The group exited after the requested signal.
    Graceful(ExitStatus),
    /// The group needed `SIGKILL`.
    Killed(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match *self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Killed(s) => s,
        }
    }
}

/// A child process that leads its own process group.
///
/// Dropping a `GroupChild` whose leader has not been reaped kills the whole
/// group, so a panic or early return never leaks a daemon.
#[derive(Debug)]
pub struct GroupChild {
    child: Child,
    pgid: Pid,
    status: Option<ExitStatus>,
}

impl GroupChild {
    /// OS pid of the group leader.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Access the underlying child, e.g. to take its pipes.
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Exit status once the leader has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Non-blocking check; reaps the leader if it has exited.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcError> {
        if self.status.is_none() {
            self.status = self.child.try_wait().map_err(|source| ProcError::Wait {
                pid: self.child.id(),
                source,
            })?;
        }
        Ok(self.status)
    }

    /// Wait up to `timeout` for the leader to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Wait up to `timeout` for the leader, then until the same deadline
    /// for the rest of the group. Only the leader decides the outcome;
    /// members that linger (or zombies nobody reaps) are swept afterwards.
    fn wait_group(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, ProcError> {
        let deadline = Instant::now() + timeout;
        let Some(status) = self.wait_timeout(timeout)? else {
            return Ok(None);
        };
        while group_alive(self.pgid) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
        Ok(Some(status))
    }

    /// `SIGKILL` whatever is left of the group once the leader is gone.
    pub(crate) fn sweep_stragglers(&self) -> Result<(), ProcError> {
        if group_alive(self.pgid) {
            tracing::debug!("Sweeping stragglers in group {}", self.pgid);
            signal_group(self.pgid, Signal::SIGKILL)?;
        }
        Ok(())
    }

    /// Signal the whole group.
    pub fn signal(&self, signal: Signal) -> Result<bool, ProcError> {
        signal_group(self.pgid, signal)
    }

    /// Stop the group: send `signal`, wait `grace`, then escalate once to
    /// `SIGKILL` and wait [`KILL_GRACE`].
    pub fn terminate(&mut self, signal: Signal, grace: Duration) -> Result<Termination, ProcError> {
        if let Some(status) = self.try_wait()? {
            self.sweep_stragglers()?;
            return Ok(Termination::AlreadyExited(status));
        }

        tracing::debug!("Sending {} to process group {}", signal, self.pgid);
        self.signal(signal)?;
        if let Some(status) = self.wait_group(grace)? {
            self.sweep_stragglers()?;
            return Ok(Termination::Graceful(status));
        }

        tracing::warn!(
            "Process group {} ignored {} for {:?}, sending SIGKILL",
            self.pgid,
            signal,
            grace
        );
        self.signal(Signal::SIGKILL)?;
        if let Some(status) = self.wait_group(KILL_GRACE)? {
            return Ok(Termination::Killed(status));
        }

        Err(ProcError::Unkillable {
            pgid: self.pgid.as_raw(),
            waited: grace + KILL_GRACE,
        })
    }
}

impl Drop for GroupChild {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(Some(_))) {
            return;
        }
        tracing::warn!("Killing leaked process group {}", self.pgid);
        if let Err(e) = self.signal(Signal::SIGKILL) {
            tracing::warn!("{}", e);
            return;
        }
        if let Ok(None) | Err(_) = self.wait_timeout(KILL_GRACE) {
            tracing::warn!("Process group {} did not exit after SIGKILL", self.pgid);
        }
    }
}
