//! Sweep configuration shared by every workload family.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Indexing structure the daemon is built around.
///
/// The name travels to the daemon verbatim through `MLFS_IDX_STRUCT`, so
/// [`IndexStructure::env_name`] must match what the daemon expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStructure {
    ExtentTrees,
    ExtentTreesTopCached,
    GlobalHashTable,
    GlobalCuckooHash,
    GlobalHashTableCompact,
    GlobalCuckooHashCompact,
    LevelHashTables,
    RadixTrees,
    None,
    #[serde(rename = "HASHFS")]
    HashFs,
}

impl IndexStructure {
    pub const ALL: [Self; 10] = [
        Self::ExtentTrees,
        Self::ExtentTreesTopCached,
        Self::GlobalHashTable,
        Self::GlobalCuckooHash,
        Self::GlobalHashTableCompact,
        Self::GlobalCuckooHashCompact,
        Self::LevelHashTables,
        Self::RadixTrees,
        Self::None,
        Self::HashFs,
    ];

    /// Structures swept when none are named on the command line.
    pub const DEFAULTS: [Self; 6] = [
        Self::ExtentTrees,
        Self::GlobalHashTable,
        Self::GlobalCuckooHash,
        Self::RadixTrees,
        Self::None,
        Self::LevelHashTables,
    ];

    pub fn env_name(self) -> &'static str {
        match self {
            Self::ExtentTrees => "EXTENT_TREES",
            Self::ExtentTreesTopCached => "EXTENT_TREES_TOP_CACHED",
            Self::GlobalHashTable => "GLOBAL_HASH_TABLE",
            Self::GlobalCuckooHash => "GLOBAL_CUCKOO_HASH",
            Self::GlobalHashTableCompact => "GLOBAL_HASH_TABLE_COMPACT",
            Self::GlobalCuckooHashCompact => "GLOBAL_CUCKOO_HASH_COMPACT",
            Self::LevelHashTables => "LEVEL_HASH_TABLES",
            Self::RadixTrees => "RADIX_TREES",
            Self::None => "NONE",
            Self::HashFs => "HASHFS",
        }
    }

    /// Lowercase name used in output file names and filebench labels.
    pub fn slug(self) -> String {
        self.env_name().to_lowercase()
    }
}

impl fmt::Display for IndexStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_name())
    }
}

impl FromStr for IndexStructure {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|structure| structure.env_name() == wanted)
            .ok_or_else(|| BenchError::config(format!("{s} is not a valid data structure")))
    }
}

/// Layout score as an integer percentage, 0 through 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutScore(u8);

impl LayoutScore {
    pub const DEFAULTS: [Self; 4] = [Self(100), Self(90), Self(80), Self(70)];
    pub const FULL: Self = Self(100);

    pub fn new(percent: u32) -> Result<Self> {
        u8::try_from(percent)
            .ok()
            .filter(|p| *p <= 100)
            .map(Self)
            .ok_or_else(|| BenchError::config(format!("layout score {percent} outside 0..=100")))
    }

    pub fn percent(self) -> u8 {
        self.0
    }

    pub fn fraction(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for LayoutScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LayoutScore {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        let percent = s
            .trim()
            .parse::<u32>()
            .map_err(|_| BenchError::config(format!("layout score {s:?} is not an integer")))?;
        Self::new(percent)
    }
}

/// Expand a human size (`4k`, `2M`, `1g`, `512`) into bytes, powers of 1024.
pub fn resolve_unit(s: &str) -> Result<u64> {
    let s = s.trim();
    let bad = || BenchError::config(format!("cannot interpret size {s:?}"));
    let last = s.chars().last().ok_or_else(bad)?;

    let (digits, unit) = match last.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 1u64 << 10),
        'm' => (&s[..s.len() - 1], 1 << 20),
        'g' => (&s[..s.len() - 1], 1 << 30),
        c if c.is_ascii_digit() => (s, 1),
        _ => return Err(bad()),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit))
        .ok_or_else(bad)
}

/// Parse a list of sizes, rejecting the first malformed entry.
pub fn resolve_units<S: AsRef<str>>(items: &[S]) -> Result<Vec<u64>> {
    items.iter().map(|s| resolve_unit(s.as_ref())).collect()
}

/// Every deadline the harness enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Measured and setup trials.
    pub trial: Duration,
    /// Trials rerun to gather cache counters, which run much slower.
    pub cache_trial: Duration,
    /// Time between SIGQUIT to a hung trial and escalating to SIGKILL.
    pub kill_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            trial: Duration::from_secs(2 * 60),
            cache_trial: Duration::from_secs(10 * 60),
            kill_grace: Duration::from_secs(10),
        }
    }
}

/// Options common to every family, validated.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub structures: Vec<IndexStructure>,
    pub layouts: Vec<LayoutScore>,
    pub trials: u32,
    pub numa_node: u32,
    pub outdir: PathBuf,
    /// Repository root holding `kernfs/`, `libfs/` and `bench/`.
    pub root: PathBuf,
    /// Mirror child output to the terminal.
    pub verbose: bool,
    /// Raise trial timeouts instead of recording them.
    pub strict: bool,
    /// Cold-initialize before every workload, not only on structure change.
    pub always_reinitialize: bool,
    pub measure_cache_perf: bool,
    pub retries: u32,
    pub timeouts: Timeouts,
}

impl BenchConfig {
    /// Defaults for a repository checked out at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            structures: IndexStructure::DEFAULTS.to_vec(),
            layouts: LayoutScore::DEFAULTS.to_vec(),
            trials: 1,
            numa_node: 0,
            outdir: PathBuf::from("./benchout"),
            root: root.into(),
            verbose: false,
            strict: false,
            always_reinitialize: false,
            measure_cache_perf: false,
            retries: 2,
            timeouts: Timeouts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.structures.is_empty() {
            return Err(BenchError::config("no data structures selected"));
        }
        if self.layouts.is_empty() {
            return Err(BenchError::config("no layout scores selected"));
        }
        if self.trials == 0 {
            return Err(BenchError::config("trial count must be at least 1"));
        }
        Ok(())
    }
}
