//! Harvesting measurement artifacts the daemon leaves in `/tmp`.
//!
//! The daemon and its client library report counters out of band: each
//! worker dumps a JSON record list to a file whose name matches a known
//! pattern. Artifacts must not outlive the trial that produced them, so
//! every harvest deletes the files it looked at, whatever the parse outcome.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BenchError, Result};

/// Where the daemon and its clients drop artifacts.
const ARTIFACT_DIR: &str = "/tmp";

const MARKER_KEYS: [&str; 3] = ["master", "startup", "shutdown"];
const PRIMARY_COUNTER: &str = "/lsm/nr";

/// A single-`*` file name pattern inside one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPattern {
    dir: PathBuf,
    prefix: String,
    suffix: String,
}

impl ArtifactPattern {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// Client-side (per trial) statistics, `/tmp/libfs_prof.*`.
    pub fn libfs_stats() -> Self {
        Self::new(ARTIFACT_DIR, "libfs_prof.", "")
    }

    /// Daemon-side statistics written on shutdown, `/tmp/kernfs_prof.*`.
    pub fn kernfs_stats() -> Self {
        Self::new(ARTIFACT_DIR, "kernfs_prof.", "")
    }

    /// Identity files the daemon writes once it is serving, `/tmp/kernfs*.pid`.
    pub fn kernfs_pid_files() -> Self {
        Self::new(ARTIFACT_DIR, "kernfs", ".pid")
    }

    /// Parse `"/dir/prefix*suffix"`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let path = Path::new(pattern);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BenchError::config(format!("artifact pattern {pattern:?} has no file name")))?;
        let (prefix, suffix) = name
            .split_once('*')
            .filter(|(_, rest)| !rest.contains('*'))
            .ok_or_else(|| BenchError::config(format!("artifact pattern {pattern:?} needs exactly one `*`")))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::new(dir, prefix, suffix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Same file-name shape, different directory.
    #[must_use]
    pub fn in_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..self.clone()
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.len() >= self.prefix.len() + self.suffix.len()
            && name.starts_with(&self.prefix)
            && name.ends_with(&self.suffix)
    }

    /// Matching files, sorted by name. A missing directory matches nothing.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BenchError::io(format!("listing {}", self.dir.display()), e)),
        };

        let mut found: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter(|entry| entry.file_name().to_str().is_some_and(|n| self.matches(n)))
            .map(|entry| entry.path())
            .collect();
        found.sort();
        Ok(found)
    }

    /// Delete every match, returning how many were removed.
    pub fn purge(&self) -> Result<usize> {
        let files = self.list()?;
        remove_all(&files)?;
        Ok(files.len())
    }
}

impl fmt::Display for ArtifactPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.dir.join(&self.prefix).display(), self.suffix)
    }
}

fn remove_all(files: &[PathBuf]) -> Result<()> {
    let mut failures = Vec::new();
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("{}: {e}", file.display())),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BenchError::CleanupFailure(format!(
            "could not remove stats artifacts: {}",
            failures.join(", ")
        )))
    }
}

/// Measurements for one trial: the qualifying stats record, stamped with
/// the trial's labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialResult(Map<String, Value>);

impl TrialResult {
    /// Build from a record, with `labels` taking precedence over any
    /// same-named record fields.
    pub fn from_record(mut record: Map<String, Value>, labels: &Map<String, Value>) -> Self {
        for (key, value) in labels {
            record.insert(key.clone(), value.clone());
        }
        Self(record)
    }

    /// A result carrying only labels, for families without stats artifacts.
    pub fn from_labels(labels: &Map<String, Value>) -> Self {
        Self(labels.clone())
    }

    /// Attach a nested group (daemon counters, cache counters).
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Subset of fields named in `keys`; absent keys are skipped.
    pub fn project(&self, keys: &[&str]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|&key| self.0.get(key).map(|v| (key.to_owned(), v.clone())))
            .collect()
    }
}

/// Reads, filters and deletes stats artifacts matching one pattern.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    pattern: ArtifactPattern,
    primary_counter: Option<String>,
}

impl StatsCollector {
    pub fn new(pattern: ArtifactPattern) -> Self {
        Self {
            pattern,
            primary_counter: Some(PRIMARY_COUNTER.to_owned()),
        }
    }

    /// Collector for the client library's per-trial artifacts.
    pub fn libfs() -> Self {
        Self::new(ArtifactPattern::libfs_stats())
    }

    /// JSON pointer to the counter that must be non-zero for a record to
    /// count as a real measurement. `None` disables the check.
    #[must_use]
    pub fn primary_counter(mut self, pointer: Option<&str>) -> Self {
        self.primary_counter = pointer.map(str::to_owned);
        self
    }

    /// Look for artifacts in `dir` instead of the daemon's default.
    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pattern = self.pattern.in_dir(dir);
        self
    }

    pub fn pattern(&self) -> &ArtifactPattern {
        &self.pattern
    }

    /// Remove leftovers from an earlier trial before a new one starts.
    pub fn purge_stale(&self) -> Result<()> {
        let removed = self.pattern.purge()?;
        if removed > 0 {
            tracing::warn!("Purged {} stale stats artifact(s) matching {}", removed, self.pattern);
        }
        Ok(())
    }

    /// Harvest the single qualifying record and stamp it with `labels`.
    pub fn collect(&self, labels: &Map<String, Value>) -> Result<TrialResult> {
        let mut records = self.harvest()?.into_iter();
        let Some(first) = records.next() else {
            return Err(BenchError::NoStatisticsProduced {
                pattern: self.pattern.to_string(),
            });
        };

        let extra = records.len();
        if extra > 0 {
            tracing::warn!(
                "AmbiguousStatistics: {} qualifying records matched {}, keeping the first",
                extra + 1,
                self.pattern
            );
        }
        Ok(TrialResult::from_record(first, labels))
    }

    /// Harvest and keep the last qualifying record, if any.
    pub fn collect_latest(&self) -> Result<Option<Map<String, Value>>> {
        Ok(self.harvest()?.pop())
    }

    fn harvest(&self) -> Result<Vec<Map<String, Value>>> {
        let files = self.pattern.list()?;
        let parsed: Result<Vec<Vec<Value>>> = files.iter().map(|f| read_records(f)).collect();
        let removed = remove_all(&files);

        let records = match (parsed, removed) {
            (Ok(records), Ok(())) => records,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(cleanup)) => {
                tracing::warn!("{}", cleanup);
                return Err(e);
            }
        };

        Ok(records
            .into_iter()
            .flatten()
            .filter_map(|value| match value {
                Value::Object(map) => Some(map),
                other => {
                    tracing::debug!("Skipping non-object stats record: {}", other);
                    None
                }
            })
            .filter(|record| self.qualifies(record))
            .collect())
    }

    fn qualifies(&self, record: &Map<String, Value>) -> bool {
        if MARKER_KEYS.iter().any(|k| record.contains_key(*k)) {
            return false;
        }
        let Some(pointer) = &self.primary_counter else {
            return true;
        };
        // Records without the counter are kept; only empty warm-up records
        // (counter present and not positive) are dropped.
        lookup(record, pointer)
            .and_then(Value::as_f64)
            .is_none_or(|n| n > 0.0)
    }
}

fn lookup<'a>(record: &'a Map<String, Value>, pointer: &str) -> Option<&'a Value> {
    let path = pointer.strip_prefix('/')?;
    match path.split_once('/') {
        Some((head, rest)) => record.get(head)?.pointer(&format!("/{rest}")),
        None => record.get(path),
    }
}

/// Parse one artifact: a JSON array (or single object), falling back to
/// newline-delimited records padded with NULs as older daemons wrote them.
fn read_records(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read(path).map_err(|e| BenchError::io(format!("reading {}", path.display()), e))?;
    let text = String::from_utf8_lossy(&raw);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    if text.is_empty() {
        tracing::warn!("Empty stats artifact {}", path.display());
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => return Ok(items),
        Ok(obj @ Value::Object(_)) => return Ok(vec![obj]),
        Ok(other) => {
            return Err(BenchError::MalformedArtifact {
                path: path.to_path_buf(),
                reason: format!("expected a record list, found {other}"),
            });
        }
        Err(_) => {}
    }

    text.lines()
        .map(|line| line.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<Value>(line).map_err(|e| BenchError::MalformedArtifact {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::daemon::DaemonSpec;

    fn setup() -> (TempDir, StatsCollector) {
        let dir = TempDir::new().unwrap();
        let collector = StatsCollector::libfs().in_dir(dir.path());
        (dir, collector)
    }

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    fn labels() -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("struct".into(), json!("EXTENT_TREES"));
        labels.insert("test".into(), json!("Insert"));
        labels
    }

    #[test]
    fn test_pattern_parse_and_match() {
        let pattern = ArtifactPattern::parse("/tmp/kernfs*.pid").unwrap();
        assert_eq!(pattern.dir(), Path::new("/tmp"));
        assert!(pattern.matches("kernfs.pid"));
        assert!(pattern.matches("kernfs_1234.pid"));
        assert!(!pattern.matches("kernfs_prof.1234"));
        assert_eq!(pattern.to_string(), "/tmp/kernfs*.pid");

        assert!(ArtifactPattern::parse("/tmp/libfs_prof.").is_err());
        assert!(ArtifactPattern::parse("/tmp/*a*").is_err());
    }

    #[test]
    fn test_well_known_patterns() {
        assert_eq!(ArtifactPattern::libfs_stats().to_string(), "/tmp/libfs_prof.*");
        assert_eq!(ArtifactPattern::kernfs_stats().to_string(), "/tmp/kernfs_prof.*");
        assert_eq!(ArtifactPattern::kernfs_pid_files().to_string(), "/tmp/kernfs*.pid");
        assert_eq!(ArtifactPattern::parse("/tmp/libfs_prof.*").unwrap(), *StatsCollector::libfs().pattern());

        let spec = DaemonSpec::kernfs(Path::new("/r"), 0);
        assert_eq!(spec.pid_files, ArtifactPattern::kernfs_pid_files());
        assert_eq!(spec.stats, Some(ArtifactPattern::kernfs_stats()));
    }

    #[test]
    fn test_zero_artifacts() {
        let (_dir, collector) = setup();
        let err = collector.collect(&labels()).unwrap_err();
        assert!(matches!(err, BenchError::NoStatisticsProduced { .. }));
    }

    #[test]
    fn test_one_artifact_superset_of_fields_and_labels() {
        let (dir, collector) = setup();
        write(
            &dir,
            "libfs_prof.4242",
            &json!([{"master": 1}, {"lsm": {"nr": 12, "tsc": 900}, "l1_hit": 3}]).to_string(),
        );

        let result = collector.collect(&labels()).unwrap();
        assert_eq!(result.get("l1_hit"), Some(&json!(3)));
        assert_eq!(result.get("lsm"), Some(&json!({"nr": 12, "tsc": 900})));
        assert_eq!(result.get("struct"), Some(&json!("EXTENT_TREES")));
        assert_eq!(result.get("test"), Some(&json!("Insert")));
        assert!(collector.pattern().list().unwrap().is_empty());
    }

    #[test]
    fn test_two_artifacts_keeps_first() {
        let (dir, collector) = setup();
        write(&dir, "libfs_prof.1", &json!([{"lsm": {"nr": 1}, "id": "a"}]).to_string());
        write(&dir, "libfs_prof.2", &json!([{"lsm": {"nr": 2}, "id": "b"}]).to_string());

        let result = collector.collect(&labels()).unwrap();
        assert_eq!(result.get("id"), Some(&json!("a")));
        assert!(collector.pattern().list().unwrap().is_empty());
    }

    #[test]
    fn test_filters_markers_and_warmup_records() {
        let (dir, collector) = setup();
        write(
            &dir,
            "libfs_prof.7",
            &json!([
                {"startup": true},
                {"lsm": {"nr": 0}},
                {"lsm": {"nr": 5}, "id": "real"},
                {"shutdown": true}
            ])
            .to_string(),
        );
        let result = collector.collect(&labels()).unwrap();
        assert_eq!(result.get("id"), Some(&json!("real")));
    }

    #[test]
    fn test_newline_delimited_with_nul_padding() {
        let (dir, collector) = setup();
        write(&dir, "libfs_prof.9", "{\"master\":1}\n{\"lsm\":{\"nr\":3}}\n\0\0\0");
        let result = collector.collect(&labels()).unwrap();
        assert_eq!(result.get("lsm"), Some(&json!({"nr": 3})));
    }

    #[test]
    fn test_malformed_artifact_is_still_deleted() {
        let (dir, collector) = setup();
        write(&dir, "libfs_prof.3", "{not json");
        let err = collector.collect(&labels()).unwrap_err();
        assert!(matches!(err, BenchError::MalformedArtifact { .. }));
        assert!(collector.pattern().list().unwrap().is_empty());
    }

    #[test]
    fn test_purge_stale_ignores_other_files() {
        let (dir, collector) = setup();
        write(&dir, "libfs_prof.old", "[]");
        write(&dir, "unrelated.json", "[]");
        collector.purge_stale().unwrap();
        assert!(collector.pattern().list().unwrap().is_empty());
        assert!(dir.path().join("unrelated.json").exists());
    }

    #[test]
    fn test_collect_latest_takes_last() {
        let dir = TempDir::new().unwrap();
        let collector = StatsCollector::new(ArtifactPattern::kernfs_stats().in_dir(dir.path())).primary_counter(None);
        assert!(collector.collect_latest().unwrap().is_none());

        write(&dir, "kernfs_prof.1", &json!([{"id": 1}, {"id": 2}]).to_string());
        let latest = collector.collect_latest().unwrap().unwrap();
        assert_eq!(latest["id"], json!(2));
        assert!(collector.pattern().list().unwrap().is_empty());
    }

    #[test]
    fn test_projection() {
        let result = TrialResult::from_record(
            json!({"total_time": 1.25, "lsm": {"nr": 1}}).as_object().unwrap().clone(),
            &labels(),
        );
        let summary = result.project(&["total_time", "struct", "missing"]);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary["total_time"], json!(1.25));
    }
}
