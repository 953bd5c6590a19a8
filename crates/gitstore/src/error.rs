use std::path::PathBuf;
use std::process::ExitStatus;

/// Failures from the subprocess runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The command could not be found on `PATH`.
    #[error("command not available: {0}")]
    CommandUnavailable(String),

    /// The command ran and exited non-zero.
    #[error("{command} exited with {status}: {stderr}")]
    ProcessFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    /// The command could not be spawned or its output not collected.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the transaction engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `git push` was rejected. The only retriable failure: the caller's
    /// transform is re-run against a re-anchored clone.
    #[error("push from {from} failed: {stderr}")]
    Push { from: PathBuf, stderr: String },

    /// The local working repository could not be created or re-anchored.
    #[error("working repository {path}: {reason}")]
    WorkingRepository { path: PathBuf, reason: String },

    #[error(transparent)]
    Process(#[from] RunnerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_push(&self) -> bool {
        matches!(self, StoreError::Push { .. })
    }
}
