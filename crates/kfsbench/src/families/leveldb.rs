//! LevelDB's `db_bench` on top of the file system.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::{pinned, TrialPlan, WorkloadFamily};
use crate::error::{BenchError, Result};
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

const SUMMARY_KEYS: &[&str] = &[
    "layout",
    "struct",
    "bench",
    "workload",
    "trial num",
    "fillseq",
    "fillrandom",
    "overwrite",
    "readseq",
    "readrandom",
];

const VARIANT_PREFIX: &str = "value_size_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelDbOptions {
    pub value_sizes: Vec<u64>,
    /// Number of keys `db_bench` inserts.
    pub db_size: u64,
}

impl Default for LevelDbOptions {
    fn default() -> Self {
        Self {
            value_sizes: vec![100],
            db_size: 300_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LevelDb {
    dir: PathBuf,
    numa_node: u32,
    options: LevelDbOptions,
}

impl LevelDb {
    pub fn new(root: &Path, numa_node: u32, options: LevelDbOptions) -> Self {
        Self {
            dir: root.join("bench").join("leveldb").join("build"),
            numa_node,
            options,
        }
    }
}

impl WorkloadFamily for LevelDb {
    fn name(&self) -> &'static str {
        "leveldb"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base.variants(self.options.value_sizes.iter().map(|v| format!("{VARIANT_PREFIX}{v}")))
    }

    fn plans(&self, workload: &Workload) -> Vec<TrialPlan> {
        let value_size = workload
            .variant
            .strip_prefix(VARIANT_PREFIX)
            .unwrap_or(&workload.variant);
        let argv = pinned(
            self.numa_node,
            &self.dir,
            "db_bench",
            [
                "--db=/mlfs".to_owned(),
                format!("--num={}", self.options.db_size),
                format!("--value_size={value_size}"),
            ],
        );
        vec![TrialPlan::solo(None, TrialCommand::new(argv, &self.dir))]
    }

    /// Every `<name> : <value> micros/op;` line becomes `name: value`.
    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        for line in output.lines() {
            let Some((name, rest)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim_end();
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                continue;
            }
            let mut tokens = rest.split_whitespace();
            let (Some(value), Some(unit)) = (tokens.next(), tokens.next()) else {
                continue;
            };
            if unit != "micros/op;" {
                continue;
            }
            let value = value
                .parse::<f64>()
                .map_or_else(|_| Value::from(value), Value::from);
            fields.insert(name.to_owned(), value);
        }

        if fields.is_empty() {
            return Err(BenchError::Parse("no `micros/op` lines in db_bench output".into()));
        }
        Ok(fields)
    }

    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("bench".into(), "leveldb".into());
        labels.insert("workload".into(), workload.variant.clone().into());
        labels.insert("layout".into(), workload.layout.fraction().into());
        labels.insert("struct".into(), workload.structure.slug().into());
        labels.insert("trial num".into(), workload.trial.into());
        labels
    }

    fn summary_keys(&self) -> &'static [&'static str] {
        SUMMARY_KEYS
    }

    fn collects_stats(&self) -> bool {
        false
    }

    fn profiling(&self) -> bool {
        false
    }
}
