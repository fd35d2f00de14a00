//! Process plumbing for the kfsbench experiment harness.
//!
//! Everything here is about supervising external programs the harness does
//! not trust: the storage daemon under test and the workload generators that
//! drive it. Each may hang, crash or fork helpers, so:
//!
//! - [`spawn_group`] makes every child the leader of a new process group and
//!   [`GroupChild::terminate`] signals the whole group with a bounded,
//!   escalating wait.
//! - [`run_captured`] runs a command to completion or deadline while
//!   collecting its output on reader threads.
//! - [`ProcessTree`] answers "is this pid one of ours?" so identity files left
//!   behind by a previous daemon are not mistaken for a live one.
//! - [`signal`] turns Ctrl+C into a flag the sweep can poll.

#![cfg(unix)]

pub mod capture;
pub mod error;
pub mod group;
pub mod process_tree;
pub mod signal;

pub use capture::{run_captured, CaptureOptions, CaptureOutcome, Captured};
pub use error::ProcError;
pub use group::{command_line, group_alive, signal_group, spawn_group, GroupChild, Termination, KILL_GRACE};
pub use process_tree::{ProcessTree, SystemProcessTree};

pub use nix::sys::signal::Signal;
