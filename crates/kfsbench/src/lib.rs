//! Benchmark sweeps against the KernFS storage daemon.
//!
//! A sweep is the cartesian product of indexing structures, layout scores
//! and family-specific parameters ([`sweep`]). [`runner::SweepRunner`] walks
//! it in order, formatting the backing store through the
//! [`daemon::DaemonController`] whenever the structure changes, running each
//! sub-trial as a timed, cancellable process group ([`trial`]), harvesting
//! the statistics the daemon and clients drop in `/tmp` ([`stats`]), and
//! writing grouped JSON results ([`results`]).
//!
//! The families that know the individual benchmark binaries live in
//! [`families`]; process plumbing lives in the `kfsbench-proc` crate.

#![cfg(unix)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod env;
pub mod error;
pub mod families;
pub mod progress;
pub mod results;
pub mod runner;
pub mod stats;
pub mod sweep;
pub mod trial;

pub use config::{BenchConfig, IndexStructure, LayoutScore, Timeouts};
pub use daemon::{Daemon, DaemonController, DaemonSpec, DaemonState, PidFileProbe, ReadinessProbe};
pub use env::TrialEnv;
pub use error::{BenchError, Result};
pub use families::{CacheGroups, TrialPlan, WorkloadFamily};
pub use progress::{ProgressCounter, ProgressReporter};
pub use results::{load_records, SweepAccumulator};
pub use runner::{SweepReport, SweepRunner};
pub use stats::{ArtifactPattern, StatsCollector, TrialResult};
pub use sweep::{SweepSpec, Workload};
pub use trial::{Continuation, TrialCommand, TrialExecutor, TrialFailure, TrialOutcome};
