//! Command-line interface.

#![allow(clippy::struct_excessive_bools)]

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{resolve_units, BenchConfig, IndexStructure, LayoutScore};
use crate::daemon::DaemonSpec;
use crate::error::Result;
use crate::families::{
    FileBench, FileBenchOptions, FragTest, FragTestOptions, LevelDb, LevelDbOptions, Mtcc, MtccOptions,
    WorkloadFamily, Ycsb, YcsbOptions,
};

/// Drive benchmark sweeps against the KernFS daemon.
///
/// Every combination of data structure, layout score and family-specific
/// parameters is run against a freshly started daemon; results are written
/// as JSON under the output directory.
#[derive(Parser, Debug)]
#[command(name = "kfsbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub bench: Bench,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Indexing structures to test with.
    #[arg(short = 'd', long = "data-structures", num_args = 1.., global = true)]
    pub data_structures: Vec<String>,

    /// Layout scores (percent) to use.
    #[arg(short = 'l', long = "layout-scores", num_args = 1.., global = true)]
    pub layout_scores: Vec<u32>,

    /// Number of trials per workload.
    #[arg(short = 't', long, default_value_t = 1, global = true)]
    pub trials: u32,

    /// NUMA node to pin the daemon and benchmarks to.
    #[arg(short = 'M', long = "numa-node", default_value_t = 0, global = true)]
    pub numa_node: u32,

    /// Where to write results.
    #[arg(short = 'o', long, default_value = "./benchout", global = true)]
    pub outdir: PathBuf,

    /// Show daemon and benchmark output.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Repository root containing `kernfs/`, `libfs/` and `bench/`.
    #[arg(long, env = "KFSBENCH_ROOT", default_value = ".", global = true)]
    pub root: PathBuf,

    /// Fail the sweep when a trial times out instead of recording it.
    #[arg(long, global = true)]
    pub strict: bool,

    /// Per-trial deadline in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 120, global = true)]
    pub trial_timeout: u64,

    /// How long to wait for the daemon to come up, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 300, global = true)]
    pub ready_timeout: u64,

    /// Times a failed workload is rerun before giving up.
    #[arg(long, default_value_t = 2, global = true)]
    pub retries: u32,

    /// Format the backing store before every workload.
    #[arg(long = "always-reinit", global = true)]
    pub always_reinit: bool,

    /// Rerun each trial with cache counters enabled.
    #[arg(short = 'c', long, global = true)]
    pub measure_cache_perf: bool,
}

#[derive(Subcommand, Debug)]
pub enum Bench {
    /// Append, sequential read and random read micro benchmark.
    Mtcc {
        /// Read/write unit sizes (e.g. 4k, 1m).
        #[arg(short = 'i', long = "io-sizes", num_args = 1.., required = true)]
        io_sizes: Vec<String>,

        /// Reads/writes per experiment.
        #[arg(short = 'r', long, num_args = 1.., default_values_t = [1u64])]
        repetitions: Vec<u64>,

        /// Starting file sizes.
        #[arg(short = 's', long = "start-sizes", num_args = 1.., default_values = ["0"])]
        start_sizes: Vec<String>,

        /// Files per test.
        #[arg(short = 'f', long = "num-files-per-test", num_args = 1.., default_values_t = [1u64])]
        num_files: Vec<u64>,

        /// Only run the read tests.
        #[arg(long)]
        skip_insert: bool,
    },

    /// Fragment a file with random writes, then time reading it back.
    Fragtest {
        /// Write and read unit sizes (e.g. 4k, 1m).
        #[arg(required = true)]
        io_sizes: Vec<String>,
    },

    /// FileBench personalities.
    Filebench {
        /// Workload file patterns under `bench/filebench`; all matches run.
        #[arg(required = true)]
        workloads: Vec<String>,
    },

    /// LevelDB `db_bench`.
    Leveldb {
        /// Number of keys.
        #[arg(long = "db-size", default_value_t = 300_000)]
        db_size: u64,

        /// Value sizes in bytes.
        #[arg(required = true)]
        value_sizes: Vec<u64>,
    },

    /// YCSB-C over LevelDB.
    Ycsb {
        /// Workload profile names under `bench/YCSB-C/workloads`.
        #[arg(short = 'P', long = "ycsb-workload", num_args = 1.., required = true)]
        workloads: Vec<String>,
    },
}

impl Cli {
    /// Validated sweep configuration.
    pub fn config(&self) -> Result<BenchConfig> {
        let args = &self.common;
        let mut config = BenchConfig::new(&args.root);

        if !args.data_structures.is_empty() {
            config.structures = args
                .data_structures
                .iter()
                .map(|s| s.parse::<IndexStructure>())
                .collect::<Result<_>>()?;
        }
        if !args.layout_scores.is_empty() {
            config.layouts = args
                .layout_scores
                .iter()
                .map(|&p| LayoutScore::new(p))
                .collect::<Result<_>>()?;
        }
        config.trials = args.trials;
        config.numa_node = args.numa_node;
        config.outdir.clone_from(&args.outdir);
        config.verbose = args.verbose;
        config.strict = args.strict;
        config.always_reinitialize = args.always_reinit;
        config.measure_cache_perf = args.measure_cache_perf;
        config.retries = args.retries;
        config.timeouts.trial = Duration::from_secs(args.trial_timeout);

        config.validate()?;
        Ok(config)
    }

    /// KernFS under the configured root.
    pub fn daemon_spec(&self, config: &BenchConfig) -> DaemonSpec {
        let mut spec = DaemonSpec::kernfs(&config.root, config.numa_node);
        spec.ready_timeout = Duration::from_secs(self.common.ready_timeout);
        spec.echo = config.verbose;
        spec
    }

    /// The family the subcommand selects.
    pub fn family(&self, config: &BenchConfig) -> Result<Box<dyn WorkloadFamily>> {
        let root = &config.root;
        let node = config.numa_node;
        Ok(match &self.bench {
            Bench::Mtcc {
                io_sizes,
                repetitions,
                start_sizes,
                num_files,
                skip_insert,
            } => Box::new(Mtcc::new(
                root,
                node,
                MtccOptions {
                    start_sizes: resolve_units(start_sizes)?,
                    io_sizes: resolve_units(io_sizes)?,
                    repetitions: repetitions.clone(),
                    num_files: num_files.clone(),
                    skip_insert: *skip_insert,
                },
            )),
            Bench::Fragtest { io_sizes } => Box::new(FragTest::new(
                root,
                node,
                FragTestOptions {
                    io_sizes: resolve_units(io_sizes)?,
                },
            )),
            Bench::Filebench { workloads } => Box::new(FileBench::new(
                root,
                node,
                &FileBenchOptions {
                    patterns: workloads.clone(),
                },
            )?),
            Bench::Leveldb { db_size, value_sizes } => Box::new(LevelDb::new(
                root,
                node,
                LevelDbOptions {
                    value_sizes: value_sizes.clone(),
                    db_size: *db_size,
                },
            )),
            Bench::Ycsb { workloads } => Box::new(Ycsb::new(
                root,
                node,
                YcsbOptions {
                    workloads: workloads.clone(),
                },
            )),
        })
    }
}
