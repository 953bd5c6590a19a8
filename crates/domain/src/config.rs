//! Typed access to process-start configuration.
//!
//! The surrounding application configures the core entirely through
//! environment variables read once at startup. [`Environment::from_vars`]
//! takes a lookup closure so tests can supply variables without touching
//! the process environment.

use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Remote location
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// URL of a git remote that mirrors a local working repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub url: String,
}

impl RemoteLocation {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ROOT_VAR: &str = "MY_ROOT";
const SERVER_PORT_VAR: &str = "MY_SERVER_PORT";
const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";
const EVENT_LOG_REMOTE_VAR: &str = "MY_EVENT_LOG_REMOTE";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("environment variable {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Process-start configuration.
///
/// `openai_api_key` and `server_port` are carried for the surrounding
/// application; the scheduler core itself only uses `working_directory`
/// and `event_log_remote`.
#[derive(Debug, Clone)]
pub struct Environment {
    pub working_directory: PathBuf,
    pub server_port: u16,
    pub openai_api_key: Option<String>,
    pub event_log_remote: Option<RemoteLocation>,
}

impl Environment {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, EnvironmentError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read configuration through a variable lookup.
    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, EnvironmentError> {
        let root = lookup(ROOT_VAR)
            .filter(|v| !v.is_empty())
            .ok_or(EnvironmentError::Missing(ROOT_VAR))?;

        let port_raw = lookup(SERVER_PORT_VAR)
            .filter(|v| !v.is_empty())
            .ok_or(EnvironmentError::Missing(SERVER_PORT_VAR))?;
        let server_port =
            port_raw
                .parse::<u16>()
                .map_err(|_| EnvironmentError::Invalid {
                    var: SERVER_PORT_VAR,
                    reason: format!("'{port_raw}' is not a port number"),
                })?;

        let openai_api_key = lookup(OPENAI_API_KEY_VAR).filter(|v| !v.is_empty());
        let event_log_remote = lookup(EVENT_LOG_REMOTE_VAR)
            .filter(|v| !v.is_empty())
            .map(RemoteLocation::new);

        Ok(Self {
            working_directory: PathBuf::from(root),
            server_port,
            openai_api_key,
            event_log_remote,
        })
    }

    /// Local working repository holding the runtime-state document.
    pub fn runtime_state_repository(&self) -> PathBuf {
        self.working_directory.join("runtime-state-repository")
    }

    /// Local working repository holding the event log.
    pub fn event_log_repository(&self) -> PathBuf {
        self.working_directory.join("event-log-repository")
    }
}
