//! Error type for process plumbing.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;

/// Errors raised while spawning, signaling or waiting on child processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The command could not be launched at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// Launch was refused by the OS (missing execute bit, sudo policy, ...).
    #[error("permission denied launching `{program}`")]
    PermissionDenied { program: String },
    /// A signal could not be delivered to a process group.
    #[error("failed to send {signal} to process group {pgid}: {errno}")]
    Signal {
        pgid: i32,
        signal: Signal,
        errno: Errno,
    },
    /// The process group survived every signal we sent it.
    #[error("process group {pgid} still alive {waited:?} after SIGKILL")]
    Unkillable { pgid: i32, waited: Duration },
    /// Waiting on a child failed.
    #[error("failed to wait on pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

impl ProcError {
    /// Whether this error means the process environment is broken and
    /// retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unkillable { .. })
    }
}
