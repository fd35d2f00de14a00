//! Accumulating trial results and persisting them per workload group.
//!
//! Each group (one indexing structure) is written exactly once as two
//! pretty-printed JSON arrays: every field of every result, and a summary
//! keeping only the family's key fields.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{BenchError, Result};
use crate::stats::TrialResult;

const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Results of the current group plus bookkeeping for the whole sweep.
#[derive(Debug)]
pub struct SweepAccumulator {
    family: String,
    outdir: PathBuf,
    summary_keys: Vec<&'static str>,
    group: Option<String>,
    pending: Vec<TrialResult>,
    written: usize,
}

impl SweepAccumulator {
    pub fn new(family: impl Into<String>, outdir: impl Into<PathBuf>, summary_keys: &[&'static str]) -> Self {
        Self {
            family: family.into(),
            outdir: outdir.into(),
            summary_keys: summary_keys.to_vec(),
            group: None,
            pending: Vec::new(),
            written: 0,
        }
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Flush the current group and start collecting `group`.
    pub fn begin_group(&mut self, group: &str) -> Result<Vec<PathBuf>> {
        let files = self.flush()?;
        self.group = Some(group.to_owned());
        Ok(files)
    }

    pub fn push(&mut self, result: TrialResult) {
        self.pending.push(result);
    }

    /// Results accepted so far, written or not.
    pub fn total(&self) -> usize {
        self.written + self.pending.len()
    }

    pub fn summary(&self) -> Vec<Map<String, Value>> {
        self.pending.iter().map(|r| r.project(&self.summary_keys)).collect()
    }

    /// Write pending results, if any, and clear them.
    pub fn flush(&mut self) -> Result<Vec<PathBuf>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        fs::create_dir_all(&self.outdir)
            .map_err(|e| BenchError::io(format!("creating {}", self.outdir.display()), e))?;

        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let group = self.group.as_deref().map_or_else(String::new, |g| format!("_{g}"));
        let full = unique_path(&self.outdir, &format!("{}{group}_{stamp}", self.family));
        let summary = unique_path(&self.outdir, &format!("{}_summary{group}_{stamp}", self.family));

        write_json(&full, &self.pending)?;
        write_json(&summary, &self.summary())?;
        tracing::info!("Wrote {} result(s) to {}", self.pending.len(), full.display());

        self.written += self.pending.len();
        self.pending.clear();
        Ok(vec![full, summary])
    }
}

impl Drop for SweepAccumulator {
    /// Save what a sweep unwinding from a panic would otherwise lose.
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::warn!("Flushing {} unsaved result(s) on the way out", self.pending.len());
        if let Err(e) = self.flush() {
            tracing::warn!("{}", BenchError::CleanupFailure(e.to_string()));
        }
    }
}

/// `dir/stem.json`, or `dir/stem_N.json` if that already exists.
fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.json"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.json"));
        n += 1;
    }
    path
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| BenchError::io(format!("writing {}", path.display()), e))
}

/// Read back a full or summary results file.
pub fn load_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let text = fs::read_to_string(path).map_err(|e| BenchError::io(format!("reading {}", path.display()), e))?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn result(struct_name: &str, total_time: f64) -> TrialResult {
        let labels = json!({"struct": struct_name, "test": "Insert", "layout": "90"});
        TrialResult::from_record(
            json!({"total_time": total_time, "lsm": {"nr": 4, "tsc": 1_234_567_u64}})
                .as_object()
                .unwrap()
                .clone(),
            labels.as_object().unwrap(),
        )
    }

    #[test]
    fn test_summary_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let keys = ["layout", "total_time", "struct", "test"];
        let mut acc = SweepAccumulator::new("mtcc", dir.path(), &keys);
        acc.begin_group("extent_trees").unwrap();
        let original = result("EXTENT_TREES", 1.25);
        acc.push(original.clone());

        let files = acc.flush().unwrap();
        assert_eq!(files.len(), 2);
        let name = files[1].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("mtcc_summary_extent_trees_"));

        let loaded = load_records(&files[1]).unwrap();
        assert_eq!(loaded.len(), 1);
        for key in keys {
            assert_eq!(loaded[0].get(key), original.get(key), "field {key}");
        }
        assert!(!loaded[0].contains_key("lsm"));

        let full = load_records(&files[0]).unwrap();
        assert_eq!(&full[0], original.fields());
    }

    #[test]
    fn test_each_group_flushed_once() {
        let dir = TempDir::new().unwrap();
        let mut acc = SweepAccumulator::new("mtcc", dir.path(), &["struct"]);

        assert!(acc.begin_group("a").unwrap().is_empty());
        acc.push(result("A", 1.0));
        acc.push(result("A", 2.0));
        assert_eq!(acc.begin_group("b").unwrap().len(), 2);
        acc.push(result("B", 3.0));
        assert_eq!(acc.flush().unwrap().len(), 2);
        assert!(acc.flush().unwrap().is_empty());

        assert_eq!(acc.total(), 3);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 4);
    }

    #[test]
    fn test_drop_writes_pending_results() {
        let dir = TempDir::new().unwrap();
        {
            let mut acc = SweepAccumulator::new("ycsb", dir.path(), &["struct"]);
            acc.begin_group("hashfs").unwrap();
            acc.push(result("HASHFS", 1.0));
        }
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("ycsb_hashfs_"));
        assert!(names[1].starts_with("ycsb_summary_hashfs_"));
    }

    #[test]
    fn test_empty_flush_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("benchout");
        let mut acc = SweepAccumulator::new("filebench", &out, &["struct"]);
        assert!(acc.flush().unwrap().is_empty());
        assert!(!out.exists());
    }

    #[test]
    fn test_unique_path_avoids_clobbering() {
        let dir = TempDir::new().unwrap();
        let first = unique_path(dir.path(), "mtcc_x");
        fs::write(&first, "[]").unwrap();
        let second = unique_path(dir.path(), "mtcc_x");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("mtcc_x_1.json"));
    }
}
