//! Sweep execution.
//!
//! The runner walks the workload list in order, formats the backing store
//! only when the indexing structure changes, runs every sub-trial of a
//! workload inside a daemon bracket, and hands finished results to the
//! accumulator. A workload that fails with a retryable error is rerun from
//! scratch against a freshly formatted store; its partial results are
//! thrown away.

use std::path::PathBuf;
use std::time::Duration;

use kfsbench_proc::signal;
use serde_json::{Map, Value};

use crate::config::BenchConfig;
use crate::daemon::{Daemon, DaemonState};
use crate::env::TrialEnv;
use crate::error::{BenchError, Result};
use crate::families::{TrialPlan, WorkloadFamily};
use crate::progress::{ProgressCounter, ProgressReporter};
use crate::results::SweepAccumulator;
use crate::stats::{StatsCollector, TrialResult};
use crate::sweep::{SweepSpec, Workload};
use crate::trial::{TrialExecutor, TrialFailure, TrialOutcome};

/// What a finished sweep did.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub workloads: usize,
    pub results: usize,
    /// Workload attempts that were thrown away and rerun.
    pub retries: usize,
    /// Trials abandoned after a timeout or launch failure.
    pub failures: Vec<TrialFailure>,
    /// Result files written, full and summary.
    pub files: Vec<PathBuf>,
}

/// Output of one successful workload attempt.
#[derive(Default)]
struct Attempt {
    results: Vec<TrialResult>,
    failures: Vec<TrialFailure>,
}

pub struct SweepRunner<D: Daemon> {
    daemon: D,
    family: Box<dyn WorkloadFamily>,
    executor: TrialExecutor,
    stats: StatsCollector,
    env: TrialEnv,
    config: BenchConfig,
    show_progress: bool,
    /// Set after a failed attempt so the retry starts from a clean store.
    force_reinit: bool,
}

impl<D: Daemon> SweepRunner<D> {
    pub fn new(daemon: D, family: Box<dyn WorkloadFamily>, config: BenchConfig) -> Self {
        Self {
            daemon,
            family,
            executor: TrialExecutor::from_config(&config),
            stats: StatsCollector::libfs(),
            env: TrialEnv::snapshot(),
            config,
            show_progress: true,
            force_reinit: false,
        }
    }

    /// Look for client stat artifacts somewhere else.
    #[must_use]
    pub fn with_stats(mut self, stats: StatsCollector) -> Self {
        self.stats = stats;
        self
    }

    /// Base environment handed to every child instead of our own.
    #[must_use]
    pub fn with_env(mut self, env: TrialEnv) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn daemon(&self) -> &D {
        &self.daemon
    }

    pub fn daemon_mut(&mut self) -> &mut D {
        &mut self.daemon
    }

    /// Run the whole sweep.
    ///
    /// Results are flushed to disk and the daemon is stopped before this
    /// returns, whether the sweep finished or not.
    pub fn run(&mut self) -> Result<SweepReport> {
        let spec = self.family.sweep(SweepSpec::new(
            self.config.structures.clone(),
            self.config.layouts.clone(),
            self.config.trials,
        ));
        let workloads = spec.generate()?;
        let expected: usize = workloads.iter().map(|w| self.family.plans(w).len()).sum();

        tracing::info!(
            "Running {} {} workload(s) across {} structure(s)",
            workloads.len(),
            self.family.name(),
            self.config.structures.len()
        );

        if self.family.collects_stats() {
            self.stats.purge_stale()?;
        }

        let progress = ProgressReporter::start(workloads.len(), self.show_progress);
        let mut acc = SweepAccumulator::new(self.family.name(), &self.config.outdir, self.family.summary_keys());
        let mut report = SweepReport {
            workloads: workloads.len(),
            ..SweepReport::default()
        };

        let outcome = self.run_workloads(&workloads, &mut acc, &mut report, &progress.counter());

        let flushed = acc.flush().map(|files| report.files.extend(files));
        let stopped = match self.daemon.state() {
            DaemonState::Initializing | DaemonState::Ready | DaemonState::Active => self.daemon.stop(),
            DaemonState::Stopped | DaemonState::Crashed => Ok(()),
        };
        drop(progress);
        report.results = acc.total();

        let cleanup = flushed.and(stopped);
        match (outcome, cleanup) {
            (Err(e), Err(cleanup)) => {
                tracing::warn!("{}", BenchError::CleanupFailure(cleanup.to_string()));
                tracing::error!("Sweep aborted after {} result(s): {}", report.results, e);
                Err(e)
            }
            (Err(e), Ok(())) => {
                tracing::error!("Sweep aborted after {} result(s): {}", report.results, e);
                Err(e)
            }
            (Ok(()), Err(cleanup)) => Err(cleanup),
            (Ok(()), Ok(())) => {
                if report.results != expected {
                    tracing::warn!(
                        "Expected {} result(s) but collected {} ({} trial(s) abandoned)",
                        expected,
                        report.results,
                        report.failures.len()
                    );
                }
                tracing::info!(
                    "Sweep finished: {} result(s) after {} retries",
                    report.results,
                    report.retries
                );
                Ok(report)
            }
        }
    }

    fn run_workloads(
        &mut self,
        workloads: &[Workload],
        acc: &mut SweepAccumulator,
        report: &mut SweepReport,
        counter: &ProgressCounter,
    ) -> Result<()> {
        for (i, workload) in workloads.iter().enumerate() {
            if signal::shutdown_requested() {
                return Err(BenchError::Interrupted);
            }

            let group = workload.structure.slug();
            if acc.group() != Some(group.as_str()) {
                report.files.extend(acc.begin_group(&group)?);
            }

            let mut retries = 0;
            let attempt = loop {
                match self.attempt(workload) {
                    Ok(attempt) => break attempt,
                    Err(e) if e.is_retryable() && retries < self.config.retries => {
                        retries += 1;
                        report.retries += 1;
                        tracing::warn!(
                            "Workload {}/{} failed: {}; retry {} of {}",
                            i + 1,
                            workloads.len(),
                            e,
                            retries,
                            self.config.retries
                        );
                        self.discard_artifacts();
                        self.force_reinit = true;
                    }
                    Err(e) => {
                        self.discard_artifacts();
                        return Err(e);
                    }
                }
            };

            report.failures.extend(attempt.failures);
            for result in attempt.results {
                acc.push(result);
            }
            counter.set(i + 1);
        }
        Ok(())
    }

    /// Run every sub-trial of `workload` once.
    fn attempt(&mut self, workload: &Workload) -> Result<Attempt> {
        let env = self
            .env
            .with_structure(workload.structure)
            .with_layout(self.family.effective_layout(workload))
            .with_cache_perf(false)
            .with_profile(self.family.profiling());

        let reinit = self.force_reinit
            || self.config.always_reinitialize
            || self.family.reinitialize_each_workload()
            || self.daemon.initialized_structure() != Some(workload.structure);
        if reinit {
            tracing::debug!("Cold-initializing for {}", workload.structure);
            self.daemon.cold_initialize(workload.structure, &env)?;
            self.force_reinit = false;
        }
        self.family.prepare_attempt()?;

        let labels = self.family.labels(workload);
        let mut attempt = Attempt::default();
        for plan in self.family.plans(workload) {
            let mut labels = labels.clone();
            if let Some(test) = plan.label {
                labels.insert("test".into(), test.into());
            }

            if self.family.collects_stats() {
                self.stats.purge_stale()?;
            }
            let timeout = self.config.timeouts.trial;
            let measured = match run_plan(&self.executor, &mut self.daemon, &*self.family, &plan, &env, timeout)? {
                TrialOutcome::Completed(measured) => measured,
                TrialOutcome::Abandoned(failure) => {
                    attempt.failures.push(failure);
                    self.discard_artifacts();
                    continue;
                }
            };
            let mut result = self.harvest(&labels, measured)?;

            if self.config.measure_cache_perf && self.family.collects_stats() {
                match self.cache_pass(&plan, &env, &labels)? {
                    TrialOutcome::Completed(cache) => result = result.with_field("cache", cache),
                    TrialOutcome::Abandoned(failure) => attempt.failures.push(failure),
                }
            }
            attempt.results.push(result);
        }
        Ok(attempt)
    }

    /// Combine labels, the parsed measurement, client stats and daemon stats.
    fn harvest(&mut self, labels: &Map<String, Value>, measured: Map<String, Value>) -> Result<TrialResult> {
        let result = if self.family.collects_stats() {
            self.stats.collect(labels)?
        } else {
            TrialResult::from_labels(labels)
        };
        let result = measured
            .into_iter()
            .fold(result, |result, (key, value)| result.with_field(key, value));

        let kernfs = self.daemon.take_daemon_stats().map_or(Value::Null, Value::Object);
        if kernfs.is_null() {
            tracing::debug!("No daemon statistics for this trial");
        }
        Ok(result.with_field("kernfs", kernfs))
    }

    /// Rerun `plan` with cache counters enabled and return the cache groups.
    fn cache_pass(
        &mut self,
        plan: &TrialPlan,
        env: &TrialEnv,
        labels: &Map<String, Value>,
    ) -> Result<TrialOutcome<Value>> {
        let env = env.with_profile(true).with_cache_perf(true);
        let timeout = self.config.timeouts.cache_trial;
        self.stats.purge_stale()?;

        if let TrialOutcome::Abandoned(failure) =
            run_plan(&self.executor, &mut self.daemon, &*self.family, plan, &env, timeout)?
        {
            self.discard_artifacts();
            return Ok(TrialOutcome::Abandoned(failure));
        }

        let groups = self.family.cache_groups();
        let record = self.stats.collect(labels)?;
        let mut cache = record
            .get(groups.client)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| BenchError::Parse(format!("cache pass produced no `{}` group", groups.client)))?;
        let daemon_stats = self.daemon.take_daemon_stats();
        let kernfs = match groups.daemon {
            Some(key) => daemon_stats.and_then(|mut stats| stats.remove(key)),
            None => daemon_stats.map(Value::Object),
        }
        .unwrap_or(Value::Null);
        cache.insert("kernfs".into(), kernfs);
        Ok(TrialOutcome::Completed(Value::Object(cache)))
    }

    /// Drop every artifact a failed or abandoned trial may have left.
    fn discard_artifacts(&mut self) {
        if let Err(e) = self.stats.pattern().purge() {
            tracing::warn!("{}", BenchError::CleanupFailure(e.to_string()));
        }
        self.daemon.take_daemon_stats();
    }
}

fn run_plan<D: Daemon + ?Sized>(
    executor: &TrialExecutor,
    daemon: &mut D,
    family: &dyn WorkloadFamily,
    plan: &TrialPlan,
    env: &TrialEnv,
    timeout: Duration,
) -> Result<TrialOutcome<Map<String, Value>>> {
    let parse = |output: &str| family.parse(output);
    match &plan.setup {
        Some(setup) => executor
            .run_setup(daemon, setup, env, timeout)?
            .run_and_finish(&plan.measured, env, timeout, parse),
        None => executor.run_trial(daemon, &plan.measured, env, timeout, parse),
    }
}
