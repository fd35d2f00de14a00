//! Fragmentation test: scatter a large file with small random writes, then
//! time a sequential read over it.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::mtcc::parse_elapsed;
use super::{pinned, TrialPlan, WorkloadFamily};
use crate::error::Result;
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

/// Size of the file that gets fragmented and read back.
const FILE_SIZE: u64 = 4 << 30;

const SUMMARY_KEYS: &[&str] = &["layout", "total_time", "struct", "bench", "workload", "cache"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragTestOptions {
    /// Write and read unit sizes.
    pub io_sizes: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct FragTest {
    dir: PathBuf,
    numa_node: u32,
    options: FragTestOptions,
}

impl FragTest {
    pub fn new(root: &Path, numa_node: u32, options: FragTestOptions) -> Self {
        Self {
            dir: root.join("libfs").join("tests"),
            numa_node,
            options,
        }
    }

    fn command(&self, binary: &str, args: Vec<String>) -> TrialCommand {
        TrialCommand::new(pinned(self.numa_node, &self.dir, binary, args), &self.dir)
    }

    /// Random `io_size` writes until the file reaches [`FILE_SIZE`].
    fn fragment(&self, io_size: u64) -> TrialCommand {
        let (io, size) = (io_size.to_string(), FILE_SIZE.to_string());
        let args = ["-b", &io, "-s", "0", "-j", "1", "-n", "1", "-M", &size, "-w", &io, "-r", "0"];
        self.command("MTCC", args.map(str::to_owned).into())
    }

    fn read_back(&self, io_size: u64) -> TrialCommand {
        let (io, size) = (io_size.to_string(), FILE_SIZE.to_string());
        let args = ["-b", &io, "-s", "1", "-j", "1", "-n", "1", "-r", &size];
        self.command("readfile", args.map(str::to_owned).into())
    }
}

impl WorkloadFamily for FragTest {
    fn name(&self) -> &'static str {
        "fragtest"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base.variants(["fragtest"]).sizes(vec![0], self.options.io_sizes.clone())
    }

    fn plans(&self, workload: &Workload) -> Vec<TrialPlan> {
        vec![TrialPlan::with_setup(
            None,
            self.fragment(workload.io_size),
            self.read_back(workload.io_size),
        )]
    }

    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        parse_elapsed(output)
    }

    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("bench".into(), "MTCC (frag test)".into());
        labels.insert("workload".into(), format!("fragtest_{}", workload.io_size).into());
        labels.insert("layout".into(), workload.layout.fraction().into());
        labels.insert("struct".into(), workload.structure.slug().into());
        labels.insert("trial num".into(), workload.trial.into());
        labels
    }

    fn summary_keys(&self) -> &'static [&'static str] {
        SUMMARY_KEYS
    }
}
