//! Ancestry checks against the live process table.

use sysinfo::{Pid, System};

/// Longest parent chain followed before giving up.
const MAX_DEPTH: usize = 64;

/// Read-only view of parent links in the process table.
pub trait ProcessTree {
    /// Parent of `pid`, or `None` when `pid` is not running.
    fn parent_of(&self, pid: u32) -> Option<u32>;

    /// Whether `pid` is `ancestor` itself or one of its descendants.
    fn descends_from(&self, pid: u32, ancestor: u32) -> bool {
        let mut current = pid;
        for _ in 0..MAX_DEPTH {
            if current == ancestor {
                return true;
            }
            match self.parent_of(current) {
                Some(parent) if parent != current => current = parent,
                _ => return false,
            }
        }
        false
    }
}

/// Snapshot of the system process table taken at construction.
pub struct SystemProcessTree {
    system: System,
}

impl SystemProcessTree {
    pub fn snapshot() -> Self {
        Self {
            system: System::new_all(),
        }
    }
}

impl ProcessTree for SystemProcessTree {
    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.system
            .process(Pid::from_u32(pid))
            .and_then(sysinfo::Process::parent)
            .map(|p| p.as_u32())
    }
}
