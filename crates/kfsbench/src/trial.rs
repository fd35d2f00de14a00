//! Running workload binaries as timed, cancellable trials.
//!
//! Every trial runs bracketed by a daemon start and stop. The bracket is a
//! guard, so the daemon is stopped on every exit path: success, parse
//! failure, timeout, or an early `?`.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use kfsbench_proc::{run_captured, CaptureOptions, CaptureOutcome, ProcError, Signal};
use serde::Serialize;

use crate::config::BenchConfig;
use crate::daemon::Daemon;
use crate::env::TrialEnv;
use crate::error::{BenchError, Result};

/// A workload command and the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialCommand {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
}

impl TrialCommand {
    pub fn new<I, S>(argv: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
        }
    }

    fn build(&self, env: &TrialEnv) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| BenchError::config("empty trial command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.cwd);
        env.apply(&mut cmd);
        Ok(cmd)
    }
}

impl fmt::Display for TrialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// A trial that was given up on without failing the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialFailure {
    pub command: String,
    pub reason: String,
    pub env: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome<T> {
    Completed(T),
    /// Timed out or could not be launched; the trial's group was killed.
    Abandoned(TrialFailure),
}

impl<T> TrialOutcome<T> {
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned(_))
    }
}

/// Runs trial commands against a [`Daemon`].
#[derive(Debug, Clone)]
pub struct TrialExecutor {
    echo: bool,
    strict: bool,
    kill_signal: Signal,
    kill_grace: Duration,
}

impl TrialExecutor {
    pub fn new(echo: bool, strict: bool, kill_grace: Duration) -> Self {
        Self {
            echo,
            strict,
            kill_signal: Signal::SIGQUIT,
            kill_grace,
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self::new(config.verbose, config.strict, config.timeouts.kill_grace)
    }

    /// Solo variant: start the daemon, run `command`, stop the daemon.
    pub fn run_trial<D, T, P>(
        &self,
        daemon: &mut D,
        command: &TrialCommand,
        env: &TrialEnv,
        timeout: Duration,
        parser: P,
    ) -> Result<TrialOutcome<T>>
    where
        D: Daemon + ?Sized,
        P: FnOnce(&str) -> Result<T>,
    {
        let guard = DaemonGuard::start(daemon, env)?;
        let outcome = self.execute(command, env, timeout, parser);
        guard.finish(outcome)
    }

    /// First half of the continuation variant: start the daemon and run an
    /// unmeasured setup command with profiling disabled. The daemon keeps
    /// running until the returned [`Continuation`] finishes or is dropped.
    pub fn run_setup<'d, D>(
        &self,
        daemon: &'d mut D,
        setup: &TrialCommand,
        env: &TrialEnv,
        timeout: Duration,
    ) -> Result<Continuation<'d, D>>
    where
        D: Daemon + ?Sized,
    {
        let guard = DaemonGuard::start(daemon, env)?;
        let setup_env = env.with_profile(false);
        if let TrialOutcome::Abandoned(failure) = self.execute(setup, &setup_env, timeout, |_| Ok(()))? {
            tracing::warn!("Setup `{}` abandoned ({}); running measured phase anyway", failure.command, failure.reason);
        }
        Ok(Continuation {
            guard,
            executor: self.clone(),
        })
    }

    /// Run `command` once, without touching the daemon.
    fn execute<T, P>(
        &self,
        command: &TrialCommand,
        env: &TrialEnv,
        timeout: Duration,
        parser: P,
    ) -> Result<TrialOutcome<T>>
    where
        P: FnOnce(&str) -> Result<T>,
    {
        let mut cmd = command.build(env)?;
        let options = CaptureOptions {
            timeout,
            kill_signal: self.kill_signal,
            grace: self.kill_grace,
            echo: self.echo,
        };
        tracing::debug!("Running trial: {}", command);

        match run_captured(&mut cmd, &options) {
            Ok(CaptureOutcome::Exited(out)) => match parser(&out.combined()) {
                Ok(value) => Ok(TrialOutcome::Completed(value)),
                Err(e) => {
                    self.report(command, env, &format!("{e} (exit {})", out.status));
                    Err(e)
                }
            },
            Ok(CaptureOutcome::TimedOut { elapsed, .. }) => {
                let failure = self.report(command, env, &format!("hung for {elapsed:?}"));
                if self.strict {
                    Err(BenchError::TrialTimeout {
                        command: failure.command,
                        timeout,
                    })
                } else {
                    Ok(TrialOutcome::Abandoned(failure))
                }
            }
            Err(e @ ProcError::PermissionDenied { .. }) => {
                let failure = self.report(command, env, &e.to_string());
                if self.strict { Err(e.into()) } else { Ok(TrialOutcome::Abandoned(failure)) }
            }
            Err(e) if e.is_fatal() => Err(BenchError::TrialUnkillable {
                command: command.to_string(),
                source: e,
            }),
            Err(e) => {
                self.report(command, env, &e.to_string());
                Err(e.into())
            }
        }
    }

    fn report(&self, command: &TrialCommand, env: &TrialEnv, reason: &str) -> TrialFailure {
        tracing::warn!("Trial `{}` failed: {} [{}]", command, reason, env.describe_overrides());
        tracing::debug!("Environment of failed trial:\n{}", env.describe_full());
        TrialFailure {
            command: command.to_string(),
            reason: reason.to_owned(),
            env: env.describe_overrides(),
        }
    }
}

/// A started daemon with its setup phase done.
#[must_use = "dropping a continuation stops the daemon without running the measured phase"]
pub struct Continuation<'d, D: Daemon + ?Sized> {
    guard: DaemonGuard<'d, D>,
    executor: TrialExecutor,
}

impl<D: Daemon + ?Sized> Continuation<'_, D> {
    /// Second half of the continuation variant: run the measured command,
    /// then stop the daemon.
    pub fn run_and_finish<T, P>(
        self,
        command: &TrialCommand,
        env: &TrialEnv,
        timeout: Duration,
        parser: P,
    ) -> Result<TrialOutcome<T>>
    where
        P: FnOnce(&str) -> Result<T>,
    {
        let outcome = self.executor.execute(command, env, timeout, parser);
        self.guard.finish(outcome)
    }
}

/// Stops the daemon when the trial bracket closes.
struct DaemonGuard<'d, D: Daemon + ?Sized> {
    daemon: Option<&'d mut D>,
}

impl<'d, D: Daemon + ?Sized> DaemonGuard<'d, D> {
    fn start(daemon: &'d mut D, env: &TrialEnv) -> Result<Self> {
        daemon.start(env)?;
        Ok(Self {
            daemon: Some(daemon),
        })
    }

    /// Stop the daemon, reporting a crash during the trial. A cleanup
    /// failure never replaces an error the trial already produced.
    fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        let Some(daemon) = self.daemon.take() else {
            return outcome;
        };
        let crashed = !daemon.is_active();
        let stopped = daemon.stop();

        match (outcome, stopped) {
            (Err(e), Err(cleanup)) => {
                tracing::warn!("{}", BenchError::CleanupFailure(cleanup.to_string()));
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Ok(_), Ok(())) if crashed => Err(BenchError::DaemonCrashed(
                "daemon exited while the trial was running".into(),
            )),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

impl<D: Daemon + ?Sized> Drop for DaemonGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.take()
            && let Err(e) = daemon.stop()
        {
            tracing::warn!("{}", BenchError::CleanupFailure(e.to_string()));
        }
    }
}
