//! Per-trial environment values.
//!
//! The daemon and workload binaries are configured only through inherited
//! environment variables. A [`TrialEnv`] is an immutable snapshot of the
//! harness environment plus overrides for the documented keys; deriving a
//! new value never touches the previous one, so no setting can leak from
//! one trial into the next.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::process::Command;
use std::sync::Arc;

use crate::config::{IndexStructure, LayoutScore};

pub const IDX_STRUCT: &str = "MLFS_IDX_STRUCT";
pub const LAYOUT_SCORE: &str = "MLFS_LAYOUT_SCORE";
pub const PROFILE: &str = "MLFS_PROFILE";
pub const CACHE_PERF: &str = "MLFS_CACHE_PERF";

const CONTROLLED_KEYS: [&str; 4] = [IDX_STRUCT, LAYOUT_SCORE, PROFILE, CACHE_PERF];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialEnv {
    base: Arc<Vec<(OsString, OsString)>>,
    overrides: BTreeMap<&'static str, String>,
}

impl TrialEnv {
    /// Snapshot the harness's own environment with profiling on, the
    /// daemon's normal measurement mode.
    pub fn snapshot() -> Self {
        Self::from_base(std::env::vars_os()).with_profile(true).with_cache_perf(false)
    }

    /// Build from an explicit base, dropping any inherited controlled keys.
    pub fn from_base<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let base = vars
            .into_iter()
            .filter(|(key, _)| !CONTROLLED_KEYS.iter().any(|k| key == k))
            .collect();
        Self {
            base: Arc::new(base),
            overrides: BTreeMap::new(),
        }
    }

    fn with(&self, key: &'static str, value: String) -> Self {
        let mut next = self.clone();
        next.overrides.insert(key, value);
        next
    }

    pub fn with_structure(&self, structure: IndexStructure) -> Self {
        self.with(IDX_STRUCT, structure.env_name().to_owned())
    }

    pub fn with_layout(&self, layout: LayoutScore) -> Self {
        self.with(LAYOUT_SCORE, layout.to_string())
    }

    pub fn with_profile(&self, enabled: bool) -> Self {
        self.with(PROFILE, flag(enabled))
    }

    pub fn with_cache_perf(&self, enabled: bool) -> Self {
        self.with(CACHE_PERF, flag(enabled))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    /// Replace `cmd`'s environment with this one.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.base.iter().map(|(k, v)| (k, v)));
        cmd.envs(&self.overrides);
    }

    /// `KEY=value` pairs for the controlled keys, for log lines.
    pub fn describe_overrides(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.overrides {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{key}={value}");
        }
        out
    }

    /// Every variable the child will see, one per line.
    pub fn describe_full(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.base.iter() {
            let _ = writeln!(out, "{}={}", key.to_string_lossy(), value.to_string_lossy());
        }
        for (key, value) in &self.overrides {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}

fn flag(enabled: bool) -> String {
    let value = if enabled { "1" } else { "0" };
    value.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrialEnv {
        TrialEnv::from_base([
            (OsString::from("PATH"), OsString::from("/usr/bin:/bin")),
            (OsString::from(PROFILE), OsString::from("stale")),
        ])
    }

    #[test]
    fn test_derivation_leaves_parent_untouched() {
        let parent = base().with_profile(true);
        let child = parent.with_profile(false).with_structure(IndexStructure::RadixTrees);

        assert_eq!(parent.get(PROFILE), Some("1"));
        assert_eq!(parent.get(IDX_STRUCT), None);
        assert_eq!(child.get(PROFILE), Some("0"));
        assert_eq!(child.get(IDX_STRUCT), Some("RADIX_TREES"));
    }

    #[test]
    fn test_inherited_controlled_keys_are_dropped() {
        let env = base();
        assert!(!env.describe_full().contains("stale"));
        assert!(env.describe_full().contains("PATH=/usr/bin:/bin"));
    }

    #[test]
    fn test_describe_overrides_is_sorted() {
        let env = base()
            .with_layout(LayoutScore::new(80).unwrap())
            .with_structure(IndexStructure::None);
        assert_eq!(env.describe_overrides(), "MLFS_IDX_STRUCT=NONE MLFS_LAYOUT_SCORE=80");
    }

    #[test]
    fn test_apply_reaches_child() {
        let env = base().with_layout(LayoutScore::new(70).unwrap());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo $MLFS_LAYOUT_SCORE");
        env.apply(&mut cmd);
        let output = cmd.output().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "70");
    }
}
