//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use kfsbench::{
    BenchConfig, BenchError, CacheGroups, Daemon, DaemonState, IndexStructure, LayoutScore, Result, StatsCollector, SweepRunner,
    SweepSpec, TrialCommand, TrialEnv, TrialPlan, Workload, WorkloadFamily,
};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

/// In-memory daemon that records what the runner asked of it.
#[derive(Default)]
pub struct ScriptedDaemon {
    pub running: bool,
    pub structure: Option<IndexStructure>,
    pub cold_inits: Vec<IndexStructure>,
    pub starts: usize,
    pub stops: usize,
    /// Starts that fail with `DaemonCrashed` before one succeeds.
    pub crashes_left: usize,
    stats: Option<Map<String, Value>>,
}

impl ScriptedDaemon {
    pub fn crashing(times: usize) -> Self {
        Self {
            crashes_left: times,
            ..Self::default()
        }
    }
}

impl Daemon for ScriptedDaemon {
    fn cold_initialize(&mut self, structure: IndexStructure, _env: &TrialEnv) -> Result<()> {
        if self.running {
            self.stop()?;
        }
        self.cold_inits.push(structure);
        self.structure = Some(structure);
        Ok(())
    }

    fn start(&mut self, _env: &TrialEnv) -> Result<()> {
        self.starts += 1;
        if self.crashes_left > 0 {
            self.crashes_left -= 1;
            return Err(BenchError::DaemonCrashed("exited during startup".into()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.stops += 1;
            self.stats = Some(json!({ "idx": { "lookups": 3 } }).as_object().cloned().unwrap_or_default());
        }
        Ok(())
    }

    fn is_active(&mut self) -> bool {
        self.running
    }

    fn state(&self) -> DaemonState {
        if self.running { DaemonState::Active } else { DaemonState::Stopped }
    }

    fn initialized_structure(&self) -> Option<IndexStructure> {
        self.structure
    }

    fn take_daemon_stats(&mut self) -> Option<Map<String, Value>> {
        self.stats.take()
    }
}

/// A family whose trials are shell one-liners run in the artifact
/// directory.
pub struct ShellFamily {
    pub dir: PathBuf,
    pub script: String,
    pub plans: usize,
    pub cache: CacheGroups,
}

/// Drops a qualifying stat artifact and reports an elapsed time.
pub const GOOD_TRIAL: &str = r#"printf '[{"lsm":{"nr":4},"seen":"%s"}]' "$MLFS_IDX_STRUCT" > "libfs_prof.$$"; echo "elapsed time: 0.25""#;

/// Drops an artifact but prints nothing the parser understands.
pub const GARBLED_TRIAL: &str = r#"printf '[{"lsm":{"nr":4}}]' > "libfs_prof.$$"; echo "bus error""#;

pub const HUNG_TRIAL: &str = "sleep 30";

/// [`GOOD_TRIAL`] at layout 100; at layout 70 prints output that makes
/// [`ShellFamily::parse`] panic.
pub const PANICKING_TRIAL: &str = r#"if [ "$MLFS_LAYOUT_SCORE" = 70 ]; then echo "unparseable!"; else printf '[{"lsm":{"nr":4}}]' > "libfs_prof.$$"; echo "elapsed time: 0.25"; fi"#;

/// Like [`GOOD_TRIAL`], but reports a `cache` group when cache counters
/// are enabled.
pub const CACHE_TRIAL: &str = r#"if [ "$MLFS_CACHE_PERF" = 1 ]; then printf '[{"lsm":{"nr":4},"cache":{"hits":7}}]' > "libfs_prof.$$"; else printf '[{"lsm":{"nr":4}}]' > "libfs_prof.$$"; fi; echo "elapsed time: 0.25""#;

impl ShellFamily {
    pub fn new(dir: &Path, script: &str, plans: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            script: script.to_owned(),
            plans,
            cache: CacheGroups::INDEX,
        }
    }

    pub fn with_cache_groups(mut self, cache: CacheGroups) -> Self {
        self.cache = cache;
        self
    }
}

impl WorkloadFamily for ShellFamily {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn sweep(&self, base: SweepSpec) -> SweepSpec {
        base
    }

    fn plans(&self, _workload: &Workload) -> Vec<TrialPlan> {
        let labels = ["Sequential Read", "Random Read"];
        (0..self.plans)
            .map(|i| {
                TrialPlan::solo(
                    labels.get(i).copied(),
                    TrialCommand::new(["sh", "-c", self.script.as_str()], &self.dir),
                )
            })
            .collect()
    }

    fn parse(&self, output: &str) -> Result<Map<String, Value>> {
        assert!(!output.contains("unparseable!"), "parser bug on {output:?}");
        let seconds = output
            .lines()
            .find_map(|line| line.strip_prefix("elapsed time:"))
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| BenchError::Parse(format!("no elapsed time in {output:?}")))?;
        let mut fields = Map::new();
        fields.insert("total_time".into(), seconds.into());
        Ok(fields)
    }

    fn summary_keys(&self) -> &'static [&'static str] {
        &["struct", "layout", "test", "total_time"]
    }

    fn cache_groups(&self) -> CacheGroups {
        self.cache
    }
}

/// Scratch space for one sweep: artifacts in `dir`, results in `dir/out`.
pub struct Harness {
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn outdir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    pub fn config(&self, structures: &[IndexStructure], layouts: &[u32]) -> BenchConfig {
        let mut config = BenchConfig::new(self.path());
        config.structures = structures.to_vec();
        config.layouts = layouts.iter().map(|&p| LayoutScore::new(p).unwrap()).collect();
        config.outdir = self.outdir();
        config.timeouts.trial = Duration::from_secs(10);
        config.timeouts.kill_grace = Duration::from_secs(1);
        config
    }

    pub fn runner(&self, daemon: ScriptedDaemon, family: ShellFamily, config: BenchConfig) -> SweepRunner<ScriptedDaemon> {
        SweepRunner::new(daemon, Box::new(family), config)
            .with_stats(StatsCollector::libfs().in_dir(self.path()))
            .with_progress(false)
    }

    /// Stat artifacts still lying around.
    pub fn leftover_artifacts(&self) -> usize {
        StatsCollector::libfs().in_dir(self.path()).pattern().list().unwrap().len()
    }

    pub fn result_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.outdir()) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries.map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }
}
