//! Subprocess invocation with memoized `PATH` resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::process::Command;

use crate::error::RunnerError;

/// Captured output of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external commands, caching where on `PATH` each one lives.
///
/// One runner is created by the composition root and shared for the life of
/// the process; the resolution cache belongs to the runner, not to the
/// module.
#[derive(Debug, Default)]
pub struct CommandRunner {
    resolved: Mutex<HashMap<String, PathBuf>>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find `command` on `PATH`. The result is memoized per runner.
    pub fn resolve(&self, command: &str) -> Result<PathBuf, RunnerError> {
        if let Some(path) = self.resolved.lock().get(command) {
            return Ok(path.clone());
        }
        let path = search_path(command)
            .ok_or_else(|| RunnerError::CommandUnavailable(command.to_string()))?;
        self.resolved
            .lock()
            .insert(command.to_string(), path.clone());
        Ok(path)
    }

    /// Run `command` with `args`, capturing stdout and stderr.
    ///
    /// A non-zero exit status is an error carrying the captured stderr.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, RunnerError> {
        let program = self.resolve(command)?;
        let mut cmd = Command::new(&program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|source| RunnerError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(RunnerError::ProcessFailed {
                command: command.to_string(),
                status: output.status,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr })
    }
}

/// Search every `PATH` entry for an executable file named `command`.
fn search_path(command: &str) -> Option<PathBuf> {
    // Absolute or relative paths bypass the search.
    if command.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(command);
        return is_executable(&path).then_some(path);
    }
    let raw = std::env::var_os("PATH")?;
    std::env::split_paths(&raw)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
