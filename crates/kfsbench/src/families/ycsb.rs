//! YCSB-C driving LevelDB stored on the file system.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use super::{pinned, TrialPlan, WorkloadFamily};
use crate::error::{BenchError, Result};
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

const DB_PATH: &str = "/mlfs/db";

const SUMMARY_KEYS: &[&str] = &["layout", "struct", "ycsb_workload", "trial num", "KTPS", "READ", "UPDATE"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YcsbOptions {
    /// Profile names under `bench/YCSB-C/workloads`.
    pub workloads: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Ycsb {
    bench_dir: PathBuf,
    libfs_dir: PathBuf,
    numa_node: u32,
    options: YcsbOptions,
}

impl Ycsb {
    pub fn new(root: &Path, numa_node: u32, options: YcsbOptions) -> Self {
        Self {
            bench_dir: root.join("bench"),
            libfs_dir: root.join("libfs").join("tests"),
            numa_node,
            options,
        }
    }
}

impl WorkloadFamily for Ycsb {
    fn name(&self) -> &'static str {
        "ycsb"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base.variants(self.options.workloads.iter().cloned())
    }

    fn plans(&self, workload: &Workload) -> Vec<TrialPlan> {
        let cleanup = pinned(self.numa_node, &self.libfs_dir, "rmrf", [DB_PATH]);
        let profile = self
            .bench_dir
            .join("YCSB-C")
            .join("workloads")
            .join(&workload.variant);
        let run = pinned(
            self.numa_node,
            &self.bench_dir,
            "YCSB-C/ycsbc",
            [
                "-db".to_owned(),
                "leveldb".to_owned(),
                "-dbfilename".to_owned(),
                DB_PATH.to_owned(),
                "-P".to_owned(),
                profile.to_string_lossy().into_owned(),
            ],
        );
        vec![TrialPlan::with_setup(
            None,
            TrialCommand::new(cleanup, &self.bench_dir),
            TrialCommand::new(run, &self.bench_dir),
        )]
    }

    /// Throughput from the `leveldb` summary line, plus per-operation
    /// counts and cycles.
    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        for line in output.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if line.contains("leveldb") {
                if let Some(ktps) = cols.last() {
                    fields.insert("KTPS".into(), (*ktps).into());
                }
            } else if let Some(op @ ("READ" | "UPDATE")) = cols.first().copied()
                && cols.len() >= 3
            {
                fields.insert(op.into(), json!({ "cnt": cols[1], "cycles": cols[2] }));
            }
        }

        if fields.is_empty() {
            return Err(BenchError::Parse("could not find throughput numbers in ycsbc output".into()));
        }
        Ok(fields)
    }

    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("struct".into(), workload.structure.env_name().into());
        labels.insert("layout".into(), workload.layout.to_string().into());
        labels.insert("ycsb_workload".into(), workload.variant.clone().into());
        labels.insert("trial num".into(), workload.trial.into());
        labels
    }

    fn summary_keys(&self) -> &'static [&'static str] {
        SUMMARY_KEYS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexStructure, LayoutScore};

    fn family() -> Ycsb {
        Ycsb::new(
            Path::new("/r"),
            0,
            YcsbOptions {
                workloads: vec!["workloada.spec".into()],
            },
        )
    }

    #[test]
    fn test_parse_throughput_and_operations() {
        let out = "\
# Loading records:\t100000
# Transaction throughput (KTPS)
leveldb\tworkloada.spec\t1\t35.2012
READ 49871 1200345
UPDATE 50129 3400120
";
        let fields = family().parse(out).unwrap();
        assert_eq!(fields["KTPS"], "35.2012");
        assert_eq!(fields["READ"]["cnt"], "49871");
        assert_eq!(fields["UPDATE"]["cycles"], "3400120");
    }

    #[test]
    fn test_parse_empty_output_fails() {
        assert!(matches!(family().parse("Segmentation fault\n"), Err(BenchError::Parse(_))));
    }

    #[test]
    fn test_plan_clears_database_first() {
        let spec = family().sweep(SweepSpec::new(vec![IndexStructure::RadixTrees], vec![LayoutScore::FULL], 1));
        let workload = &spec.generate().unwrap()[0];
        let plans = family().plans(workload);
        assert_eq!(plans.len(), 1);

        let setup = plans[0].setup.as_ref().unwrap().to_string();
        assert!(setup.ends_with("/r/libfs/tests/rmrf /mlfs/db"));
        let run = plans[0].measured.to_string();
        assert!(run.starts_with("taskset -c 0 numactl -N 0 -m 0 /r/bench/run.sh /r/bench/YCSB-C/ycsbc"));
        assert!(run.ends_with("-P /r/bench/YCSB-C/workloads/workloada.spec"));

        let labels = family().labels(workload);
        assert_eq!(labels["ycsb_workload"], "workloada.spec");
        assert_eq!(labels["struct"], "RADIX_TREES");
    }
}
