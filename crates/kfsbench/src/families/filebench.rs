//! FileBench personalities run through the `filebench.mlfs` port.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use walkdir::WalkDir;

use super::{pinned, CacheGroups, TrialPlan, WorkloadFamily};
use crate::config::{IndexStructure, LayoutScore};
use crate::error::{BenchError, Result};
use crate::stats::ArtifactPattern;
use crate::sweep::{SweepSpec, Workload};
use crate::trial::TrialCommand;

const SUMMARY_KEYS: &[&str] = &["layout", "throughput", "struct", "bench", "workload", "cache"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBenchOptions {
    /// Glob patterns relative to `bench/filebench`. `*` stays inside one
    /// path component; `**` spans directories.
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FileBench {
    dir: PathBuf,
    numa_node: u32,
    /// Workload files, absolute.
    workloads: Vec<PathBuf>,
    shm: ArtifactPattern,
}

impl FileBench {
    /// Resolve the workload patterns against `root/bench/filebench`.
    ///
    /// A pattern matching nothing is a warning; no matches at all is an
    /// error.
    pub fn new(root: &Path, numa_node: u32, options: &FileBenchOptions) -> Result<Self> {
        let dir = root.join("bench").join("filebench");
        let workloads = find_workloads(&dir, &options.patterns)?;
        Ok(Self {
            dir,
            numa_node,
            workloads,
            shm: ArtifactPattern::new("/tmp", "filebench-shm-", ""),
        })
    }

    /// Where leftover shared-memory segments are looked for.
    #[must_use]
    pub fn shm_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm = self.shm.in_dir(dir);
        self
    }

    pub fn workloads(&self) -> &[PathBuf] {
        &self.workloads
    }
}

fn find_workloads(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();

    let mut workloads = Vec::new();
    for pattern in patterns {
        let before = workloads.len();
        for file in &files {
            let Ok(relative) = file.strip_prefix(dir) else {
                continue;
            };
            if glob_match(pattern, &relative.to_string_lossy()) && !workloads.contains(file) {
                workloads.push(file.clone());
            }
        }
        if workloads.len() == before {
            tracing::warn!("Pattern \"{}\" resulted in no workload file matches", pattern);
        }
    }

    if workloads.is_empty() {
        return Err(BenchError::config(format!(
            "no valid workloads found under {}",
            dir.display()
        )));
    }
    Ok(workloads)
}

/// Glob over `/`-separated paths: a `**` component matches any number of
/// components, everything else matches exactly one.
fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = path.split('/').collect();
    match_components(&pattern, &path)
}

fn match_components(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_components(rest, &path[skip..])),
        Some((head, rest)) => path
            .split_first()
            .is_some_and(|(component, tail)| wildcard_match(head, component) && match_components(rest, tail)),
    }
}

/// Shell-style matching with `*` and `?` within one path component.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    pi = star + 1;
                    ti = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// `fileserver` for `.../workloads/fileserver.f`.
fn workload_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .and_then(|name| name.split('.').next().map(str::to_owned))
        .unwrap_or_default()
}

impl WorkloadFamily for FileBench {
    fn name(&self) -> &'static str {
        "filebench"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base.variants(self.workloads.iter().map(|p| p.to_string_lossy().into_owned()))
    }

    fn plans(&self, workload: &Workload) -> Vec<TrialPlan> {
        let argv = pinned(self.numa_node, &self.dir, "filebench.mlfs", ["-f", workload.variant.as_str()]);
        vec![TrialPlan::solo(None, TrialCommand::new(argv, &self.dir))]
    }

    /// The first token carrying `mb/s` is the throughput.
    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        let throughput = output
            .lines()
            .flat_map(|line| line.split(' '))
            .find(|token| token.contains("mb/s"))
            .ok_or_else(|| BenchError::Parse("could not find throughput numbers".into()))?;
        let value: f64 = throughput
            .replace("mb/s", "")
            .parse()
            .map_err(|_| BenchError::Parse(format!("unreadable throughput `{throughput}`")))?;

        let mut fields = Map::new();
        fields.insert("throughput".into(), value.into());
        Ok(fields)
    }

    fn labels(&self, workload: &Workload) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("bench".into(), "filebench".into());
        labels.insert("workload".into(), workload_name(Path::new(&workload.variant)).into());
        labels.insert("layout".into(), self.effective_layout(workload).fraction().into());
        labels.insert("struct".into(), workload.structure.slug().into());
        labels.insert("trial num".into(), workload.trial.into());
        labels
    }

    fn summary_keys(&self) -> &'static [&'static str] {
        SUMMARY_KEYS
    }

    fn effective_layout(&self, workload: &Workload) -> LayoutScore {
        if workload.structure == IndexStructure::LevelHashTables && workload.layout != LayoutScore::FULL {
            tracing::warn!(
                "{} breaks with layout {}, using {}",
                workload.structure,
                workload.layout,
                LayoutScore::FULL
            );
            return LayoutScore::FULL;
        }
        workload.layout
    }

    fn reinitialize_each_workload(&self) -> bool {
        true
    }

    /// The filebench port reports a plain `cache` group.
    fn cache_groups(&self) -> CacheGroups {
        CacheGroups {
            client: "cache",
            daemon: None,
        }
    }

    fn prepare_attempt(&self) -> Result<()> {
        for segment in self.shm.list()? {
            fs::remove_file(&segment).map_err(|e| BenchError::io(format!("removing {}", segment.display()), e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn tree() -> TempDir {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("bench/filebench/workloads");
        fs::create_dir_all(&dir).unwrap();
        for name in ["fileserver.f", "varmail.f", "webserver.f", "notes.txt"] {
            fs::write(dir.join(name), "").unwrap();
        }
        root
    }

    fn workload(structure: IndexStructure, layout: u32, variant: &str) -> Workload {
        Workload {
            structure,
            layout: LayoutScore::new(layout).unwrap(),
            variant: variant.into(),
            start_size: 0,
            io_size: 0,
            repetitions: 1,
            num_files: 1,
            trial: 0,
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("workloads/*.f", "workloads/varmail.f"));
        assert!(glob_match("workloads/*mail*", "workloads/varmail.f"));
        assert!(glob_match("workloads/?armail.f", "workloads/varmail.f"));
        assert!(!glob_match("*.f", "workloads/notes.txt"));
        assert!(!glob_match("varmail.f", "workloads/varmail.f"));
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        assert!(!glob_match("*mail*", "workloads/varmail.f"));
        assert!(!glob_match("*", "workloads/varmail.f"));
        assert!(!glob_match("w*/x.f", "workloads/sub/x.f"));
        assert!(glob_match("**/*mail*", "workloads/varmail.f"));
        assert!(glob_match("**/*.f", "varmail.f"));
        assert!(glob_match("workloads/**/x.f", "workloads/a/b/x.f"));
        assert!(glob_match("workloads/**", "workloads/a/b/x.f"));
    }

    #[test]
    fn test_patterns_resolve_to_sorted_files() {
        let root = tree();
        let options = FileBenchOptions {
            patterns: vec!["workloads/*.f".into(), "**/*varmail*".into(), "*varmail*".into()],
        };
        let family = FileBench::new(root.path(), 0, &options).unwrap();
        let names: Vec<_> = family.workloads().iter().map(|p| workload_name(p)).collect();
        assert_eq!(names, ["fileserver", "varmail", "webserver"]);
    }

    #[test]
    fn test_no_matches_is_configuration_error() {
        let root = tree();
        let options = FileBenchOptions {
            patterns: vec!["*.bogus".into()],
        };
        let err = FileBench::new(root.path(), 0, &options).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_parse_throughput() {
        let root = tree();
        let family = FileBench::new(root.path(), 0, &FileBenchOptions { patterns: vec!["**/*".into()] }).unwrap();
        let out = "41.222: IO Summary: 120 ops 1.9 ops/s 0/0 rd/wr 12.5mb/s 0.5ms/op\n";
        assert_eq!(family.parse(out).unwrap()["throughput"], 12.5);
        assert!(matches!(family.parse("no summary\n"), Err(BenchError::Parse(_))));
    }

    #[test]
    fn test_level_hash_tables_forced_to_full_layout() {
        let root = tree();
        let family = FileBench::new(root.path(), 0, &FileBenchOptions { patterns: vec!["**/*".into()] }).unwrap();
        let w = workload(IndexStructure::LevelHashTables, 70, "/x/workloads/varmail.f");
        assert_eq!(family.effective_layout(&w), LayoutScore::FULL);
        let labels = family.labels(&w);
        assert_eq!(labels["layout"], 1.0);
        assert_eq!(labels["workload"], "varmail");
        assert_eq!(labels["struct"], "level_hash_tables");

        let w = workload(IndexStructure::RadixTrees, 70, "/x/workloads/varmail.f");
        assert_eq!(family.effective_layout(&w).percent(), 70);
    }

    #[test]
    fn test_cache_counters_live_under_cache() {
        let root = tree();
        let family = FileBench::new(root.path(), 0, &FileBenchOptions { patterns: vec!["**/*.f".into()] }).unwrap();
        let groups = family.cache_groups();
        assert_eq!(groups.client, "cache");
        assert_eq!(groups.daemon, None);
        assert_ne!(groups, CacheGroups::INDEX);
    }

    #[test]
    fn test_prepare_attempt_removes_shm_segments() {
        let root = tree();
        let shm = TempDir::new().unwrap();
        fs::write(shm.path().join("filebench-shm-1234"), "").unwrap();
        fs::write(shm.path().join("unrelated"), "").unwrap();
        let family = FileBench::new(root.path(), 0, &FileBenchOptions { patterns: vec!["**/*".into()] })
            .unwrap()
            .shm_in(shm.path());
        family.prepare_attempt().unwrap();
        assert!(!shm.path().join("filebench-shm-1234").exists());
        assert!(shm.path().join("unrelated").exists());
    }
}
