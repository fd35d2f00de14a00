//! Workload families.
//!
//! A family knows which binaries make up one kind of benchmark, how to
//! lay its options out as a sweep, and how to read a measurement out of the
//! binary's output. Everything else (daemon lifecycle, retries, stats,
//! persistence) is shared and lives in [`crate::runner`].

mod filebench;
mod fragtest;
mod leveldb;
mod mtcc;
mod ycsb;

use std::path::Path;

use serde_json::{Map, Value};

use crate::config::LayoutScore;
use crate::error::Result;
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

pub use filebench::{FileBench, FileBenchOptions};
pub use fragtest::{FragTest, FragTestOptions};
pub use leveldb::{LevelDb, LevelDbOptions};
pub use mtcc::{Mtcc, MtccOptions};
pub use ycsb::{Ycsb, YcsbOptions};

/// One sub-trial of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPlan {
    /// Stamped on the result as `test`, when present.
    pub label: Option<&'static str>,
    /// Unmeasured phase run against the same daemon instance first.
    pub setup: Option<TrialCommand>,
    pub measured: TrialCommand,
}

impl TrialPlan {
    pub fn solo(label: Option<&'static str>, measured: TrialCommand) -> Self {
        Self {
            label,
            setup: None,
            measured,
        }
    }

    pub fn with_setup(label: Option<&'static str>, setup: TrialCommand, measured: TrialCommand) -> Self {
        Self {
            label,
            setup: Some(setup),
            measured,
        }
    }
}

/// Where a cache pass finds its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGroups {
    /// Key of the cache counters in the client record.
    pub client: &'static str,
    /// Key of the cache counters in the daemon's statistics. `None` nests
    /// the daemon's statistics whole.
    pub daemon: Option<&'static str>,
}

impl CacheGroups {
    /// Index cache counters on both sides.
    pub const INDEX: Self = Self {
        client: "idx_cache",
        daemon: Some("idx_cache"),
    };
}

/// What the runner needs to know about a kind of benchmark.
pub trait WorkloadFamily {
    /// Prefix of the output files.
    fn name(&self) -> &'static str;

    /// Fill in the family's own dimensions on top of the common ones.
    fn sweep(&self, base: SweepSpec) -> SweepSpec;

    /// Sub-trials of one workload, in the order they run.
    fn plans(&self, workload: &Workload) -> Vec<TrialPlan>;

    /// Extract the measurement from the measured command's output.
    fn parse(&self, output: &str) -> Result<Map<String, Value>>;

    /// Labels stamped on every result of `workload`.
    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        workload.labels()
    }

    /// Fields kept in the summary file.
    fn summary_keys(&self) -> &'static [&'static str];

    /// Whether trials leave client-side stat artifacts behind.
    fn collects_stats(&self) -> bool {
        true
    }

    /// Whether the daemon and clients run with profiling enabled.
    fn profiling(&self) -> bool {
        true
    }

    /// Layout score actually handed to the daemon.
    fn effective_layout(&self, workload: &Workload) -> LayoutScore {
        workload.layout
    }

    /// Format the backing store before every workload, not only when the
    /// structure changes.
    fn reinitialize_each_workload(&self) -> bool {
        false
    }

    /// Which stats groups the cache pass moves under `cache`.
    fn cache_groups(&self) -> CacheGroups {
        CacheGroups::INDEX
    }

    /// Clean up leftovers of a previous attempt before running one.
    fn prepare_attempt(&self) -> Result<()> {
        Ok(())
    }
}

/// `taskset -c 0 numactl -N <node> -m <node> <dir>/run.sh <dir>/<binary> <args>`.
pub(crate) fn pinned<I, S>(numa_node: u32, dir: &Path, binary: &str, args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let node = numa_node.to_string();
    let mut argv: Vec<String> = vec![
        "taskset".into(),
        "-c".into(),
        "0".into(),
        "numactl".into(),
        "-N".into(),
        node.clone(),
        "-m".into(),
        node,
        in_dir(dir, "run.sh"),
        in_dir(dir, binary),
    ];
    argv.extend(args.into_iter().map(Into::into));
    argv
}

pub(crate) fn in_dir(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

/// First line of `output` containing `needle`.
pub(crate) fn line_containing<'a>(output: &'a str, needle: &str) -> Option<&'a str> {
    output.lines().find(|line| line.contains(needle))
}
