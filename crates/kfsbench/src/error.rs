//! Error taxonomy for sweeps.
//!
//! [`BenchError::is_retryable`] encodes the propagation policy: the runner
//! reinitializes the daemon and retries the workload for retryable errors,
//! and aborts the sweep (after flushing) for everything else.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kfsbench_proc::ProcError;

pub type Result<T, E = BenchError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// Invalid sweep parameters. Never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The format command failed; the backing store is in an unknown state.
    #[error("cold initialization for {structure} failed: {reason}")]
    ColdInitFailed { structure: String, reason: String },

    #[error("daemon did not become ready within {waited:?}")]
    DaemonStartTimeout { waited: Duration },

    #[error("daemon died unexpectedly: {0}")]
    DaemonCrashed(String),

    /// Only raised in strict mode; otherwise timeouts are reported as outcomes.
    #[error("trial `{command}` exceeded {timeout:?}")]
    TrialTimeout { command: String, timeout: Duration },

    #[error("trial `{command}` could not be killed: {source}")]
    TrialUnkillable {
        command: String,
        #[source]
        source: ProcError,
    },

    /// The trial ran but its output lacked the expected result marker.
    #[error("could not parse trial output: {0}")]
    Parse(String),

    #[error("no qualifying statistics records matched {pattern}")]
    NoStatisticsProduced { pattern: String },

    #[error("malformed stats artifact {}: {reason}", path.display())]
    MalformedArtifact { path: PathBuf, reason: String },

    #[error("cleanup failed: {0}")]
    CleanupFailure(String),

    #[error("sweep interrupted")]
    Interrupted,

    #[error(transparent)]
    Process(#[from] ProcError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether reinitializing the daemon and rerunning the workload may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::ColdInitFailed { .. }
            | Self::TrialUnkillable { .. }
            | Self::Interrupted
            | Self::Json(_) => false,
            Self::Process(e) => !e.is_fatal(),
            Self::DaemonStartTimeout { .. }
            | Self::DaemonCrashed(_)
            | Self::TrialTimeout { .. }
            | Self::Parse(_)
            | Self::NoStatisticsProduced { .. }
            | Self::MalformedArtifact { .. }
            | Self::CleanupFailure(_)
            | Self::Io { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(BenchError::DaemonCrashed("exit 139".into()).is_retryable());
        assert!(BenchError::Parse("no elapsed time".into()).is_retryable());
        assert!(
            BenchError::NoStatisticsProduced {
                pattern: "/tmp/libfs_prof.*".into()
            }
            .is_retryable()
        );
        assert!(!BenchError::config("empty layout list").is_retryable());
        assert!(!BenchError::Interrupted.is_retryable());
        assert!(
            !BenchError::Process(ProcError::Unkillable {
                pgid: 7,
                waited: Duration::from_secs(12),
            })
            .is_retryable()
        );
    }

    #[test]
    fn test_messages_name_the_command() {
        let err = BenchError::TrialTimeout {
            command: "readfile -b 4096".into(),
            timeout: Duration::from_secs(120),
        };
        assert!(err.to_string().contains("readfile -b 4096"));
    }
}
