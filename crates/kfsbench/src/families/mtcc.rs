//! Micro benchmark: append a file set, then read it back sequentially and
//! randomly.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::{line_containing, pinned, TrialPlan, WorkloadFamily};
use crate::error::{BenchError, Result};
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

/// Largest block the read-test setup writes with.
const MAX_SETUP_BLOCK: u64 = 4 * 1024 * 1024;

const SUMMARY_KEYS: &[&str] = &[
    "layout",
    "total_time",
    "struct",
    "test",
    "io size",
    "repetitions",
    "num files",
    "trial num",
    "start size",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtccOptions {
    pub start_sizes: Vec<u64>,
    pub io_sizes: Vec<u64>,
    pub repetitions: Vec<u64>,
    pub num_files: Vec<u64>,
    /// Only run the read tests.
    pub skip_insert: bool,
}

#[derive(Debug, Clone)]
pub struct Mtcc {
    dir: PathBuf,
    numa_node: u32,
    options: MtccOptions,
}

impl Mtcc {
    pub fn new(root: &Path, numa_node: u32, options: MtccOptions) -> Self {
        Self {
            dir: root.join("libfs").join("tests"),
            numa_node,
            options,
        }
    }

    fn command(&self, binary: &str, args: Vec<String>) -> TrialCommand {
        TrialCommand::new(pinned(self.numa_node, &self.dir, binary, args), &self.dir)
    }

    fn insert(&self, w: &Workload) -> TrialCommand {
        let written = w.io_size * w.repetitions;
        let end_size = w.start_size + written / w.num_files.max(1);
        self.command(
            "MTCC",
            args([
                "-b".into(),
                w.io_size.to_string(),
                "-s".into(),
                "1".into(),
                "-j".into(),
                "1".into(),
                "-n".into(),
                w.num_files.to_string(),
                "-S".into(),
                w.start_size.to_string(),
                "-M".into(),
                end_size.to_string(),
                "-w".into(),
                written.to_string(),
                "-r".into(),
                "0".into(),
            ]),
        )
    }

    /// Writes the file set the read tests read back.
    fn read_setup(&self, w: &Workload) -> TrialCommand {
        let block = w.start_size.min(MAX_SETUP_BLOCK);
        self.command(
            "MTCC",
            args([
                "-b".into(),
                block.to_string(),
                "-s".into(),
                "1".into(),
                "-j".into(),
                "1".into(),
                "-n".into(),
                w.num_files.to_string(),
                "-M".into(),
                w.start_size.to_string(),
                "-w".into(),
                w.start_size.to_string(),
                "-r".into(),
                "0".into(),
                "-S".into(),
                "0".into(),
            ]),
        )
    }

    fn read(&self, w: &Workload, sequential: bool) -> TrialCommand {
        let mut argv = args([
            "-b".into(),
            w.io_size.to_string(),
            "-s".into(),
            if sequential { "1" } else { "0" }.into(),
            "-j".into(),
            "1".into(),
            "-n".into(),
            w.num_files.to_string(),
            "-r".into(),
            (w.io_size * w.repetitions).to_string(),
        ]);
        if !sequential {
            argv.push("-x".into());
        }
        self.command("readfile", argv)
    }
}

/// `elapsed time: <seconds>` becomes `total_time`.
pub(super) fn parse_elapsed(output: &str) -> Result<Map<String, Value>> {
    let line = line_containing(output, "elapsed time")
        .ok_or_else(|| BenchError::Parse("no `elapsed time` line in MTCC output".into()))?;
    let seconds: f64 = line
        .split(':')
        .nth(1)
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BenchError::Parse(format!("unreadable elapsed time in `{line}`")))?;

    let mut fields = Map::new();
    fields.insert("total_time".into(), seconds.into());
    Ok(fields)
}

fn args<const N: usize>(items: [String; N]) -> Vec<String> {
    items.into()
}

impl WorkloadFamily for Mtcc {
    fn name(&self) -> &'static str {
        "mtcc"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base.variants(["mtcc"])
            .sizes(self.options.start_sizes.clone(), self.options.io_sizes.clone())
            .repetitions(self.options.repetitions.clone())
            .num_files(self.options.num_files.clone())
    }

    fn plans(&self, workload: &Workload) -> Vec<TrialPlan> {
        let mut plans = Vec::with_capacity(3);
        if !self.options.skip_insert {
            plans.push(TrialPlan::solo(Some("Insert"), self.insert(workload)));
        }
        plans.push(TrialPlan::with_setup(
            Some("Sequential Read"),
            self.read_setup(workload),
            self.read(workload, true),
        ));
        plans.push(TrialPlan::with_setup(
            Some("Random Read"),
            self.read_setup(workload),
            self.read(workload, false),
        ));
        plans
    }

    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        parse_elapsed(output)
    }

    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        let mut labels = workload.labels();
        labels.remove("workload");
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

    fn family(skip_insert: bool) -> Mtcc {
        Mtcc::new(
            Path::new("/r"),
            0,
            MtccOptions {
                start_sizes: vec![0, 8 << 20],
                io_sizes: vec![4096],
                repetitions: vec![1000],
                num_files: vec![4],
                skip_insert,
            },
        )
    }

    fn workload(start_size: u64) -> Workload {
        Workload {
            structure: IndexStructure::ExtentTrees,
            layout: LayoutScore::FULL,
            variant: "mtcc".into(),
            start_size,
            io_size: 4096,
            repetitions: 1000,
            num_files: 4,
            trial: 0,
        }
    }

    #[test]
    fn test_parse_elapsed_time() {
        let out = "opening files\nelapsed time: 1.5\ndone\n";
        let fields = family(false).parse(out).unwrap();
        assert_eq!(fields["total_time"], 1.5);
    }

    #[test]
    fn test_parse_without_elapsed_time_fails() {
        let err = family(false).parse("segfault\n").unwrap_err();
        assert!(matches!(err, BenchError::Parse(_)));
        let err = family(false).parse("elapsed time: soon\n").unwrap_err();
        assert!(matches!(err, BenchError::Parse(_)));
    }

    #[test]
    fn test_insert_end_size() {
        let plans = family(false).plans(&workload(1 << 20));
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].label, Some("Insert"));
        assert!(plans[0].setup.is_none());
        let argv = &plans[0].measured.argv;
        let end = argv.iter().position(|a| a == "-M").unwrap() + 1;
        assert_eq!(argv[end], (1_048_576 + 4096 * 1000 / 4).to_string());
    }

    #[test]
    fn test_read_setup_block_is_capped() {
        let plans = family(true).plans(&workload(8 << 20));
        assert_eq!(plans.len(), 2);
        let setup = plans[0].setup.as_ref().unwrap();
        let block = setup.argv.iter().position(|a| a == "-b").unwrap() + 1;
        assert_eq!(setup.argv[block], MAX_SETUP_BLOCK.to_string());
        assert!(plans[1].measured.argv.ends_with(&["-x".to_owned()]));
        assert_eq!(plans[1].label, Some("Random Read"));
    }

    #[test]
    fn test_sweep_uses_size_dimensions() {
        let spec = family(false).sweep(SweepSpec::new(vec![IndexStructure::ExtentTrees], vec![LayoutScore::FULL], 2));
        assert_eq!(spec.len(), 4);
        let labels = family(false).labels(&workload(0));
        assert!(!labels.contains_key("workload"));
        assert_eq!(labels["io size"], 4096);
    }
}
