//! Workload sweep generation.
//!
//! A sweep is the cartesian product of the per-dimension option lists. The
//! indexing structure is the outermost dimension: changing it forces a cold
//! initialization of the daemon, so every other dimension varies faster.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{IndexStructure, LayoutScore};
use crate::error::{BenchError, Result};

/// One point in the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Workload {
    pub structure: IndexStructure,
    pub layout: LayoutScore,
    /// Family-specific named workload (filebench file, YCSB profile, ...).
    pub variant: String,
    pub start_size: u64,
    pub io_size: u64,
    pub repetitions: u64,
    pub num_files: u64,
    pub trial: u32,
}

impl Workload {
    /// Labels describing every swept dimension.
    pub fn labels(&self) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("struct".into(), self.structure.env_name().into());
        labels.insert("layout".into(), self.layout.to_string().into());
        labels.insert("workload".into(), self.variant.clone().into());
        labels.insert("start size".into(), self.start_size.into());
        labels.insert("io size".into(), self.io_size.into());
        labels.insert("repetitions".into(), self.repetitions.into());
        labels.insert("num files".into(), self.num_files.into());
        labels.insert("trial num".into(), self.trial.into());
        labels
    }
}

/// Option lists for every sweep dimension.
///
/// Families that ignore a dimension leave it at its single default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSpec {
    pub structures: Vec<IndexStructure>,
    pub layouts: Vec<LayoutScore>,
    pub variants: Vec<String>,
    pub start_sizes: Vec<u64>,
    pub io_sizes: Vec<u64>,
    pub repetitions: Vec<u64>,
    pub num_files: Vec<u64>,
    pub trials: u32,
}

impl SweepSpec {
    pub fn new(structures: Vec<IndexStructure>, layouts: Vec<LayoutScore>, trials: u32) -> Self {
        Self {
            structures,
            layouts,
            variants: vec![String::new()],
            start_sizes: vec![0],
            io_sizes: vec![0],
            repetitions: vec![1],
            num_files: vec![1],
            trials,
        }
    }

    #[must_use]
    pub fn variants<I, S>(mut self, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variants = variants.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn sizes(mut self, start_sizes: Vec<u64>, io_sizes: Vec<u64>) -> Self {
        self.start_sizes = start_sizes;
        self.io_sizes = io_sizes;
        self
    }

    #[must_use]
    pub fn repetitions(mut self, repetitions: Vec<u64>) -> Self {
        self.repetitions = repetitions;
        self
    }

    #[must_use]
    pub fn num_files(mut self, num_files: Vec<u64>) -> Self {
        self.num_files = num_files;
        self
    }

    /// Number of workloads [`SweepSpec::generate`] will produce.
    pub fn len(&self) -> usize {
        self.structures.len()
            * self.layouts.len()
            * self.variants.len()
            * self.start_sizes.len()
            * self.io_sizes.len()
            * self.repetitions.len()
            * self.num_files.len()
            * self.trials as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self) -> Result<()> {
        let dimensions = [
            ("data structures", self.structures.len()),
            ("layout scores", self.layouts.len()),
            ("workloads", self.variants.len()),
            ("start sizes", self.start_sizes.len()),
            ("io sizes", self.io_sizes.len()),
            ("repetitions", self.repetitions.len()),
            ("file counts", self.num_files.len()),
            ("trials", self.trials as usize),
        ];
        match dimensions.iter().find(|(_, len)| *len == 0) {
            Some((name, _)) => Err(BenchError::config(format!("sweep dimension `{name}` is empty"))),
            None => Ok(()),
        }
    }

    /// Expand into the ordered workload list, structure outermost.
    pub fn generate(&self) -> Result<Vec<Workload>> {
        self.validate()?;

        let mut workloads = Vec::with_capacity(self.len());
        for &structure in &self.structures {
            for &layout in &self.layouts {
                for variant in &self.variants {
                    for &start_size in &self.start_sizes {
                        for &io_size in &self.io_sizes {
                            for &repetitions in &self.repetitions {
                                for &num_files in &self.num_files {
                                    for trial in 0..self.trials {
                                        workloads.push(Workload {
                                            structure,
                                            layout,
                                            variant: variant.clone(),
                                            start_size,
                                            io_size,
                                            repetitions,
                                            num_files,
                                            trial,
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(workloads)
    }
}
