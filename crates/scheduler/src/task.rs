//! Task registrations and their persisted records.
//!
//! A [`Registration`] is what the surrounding application hands to the
//! scheduler at startup; a [`TaskRecord`] is the persisted trace of one
//! registered task. Records deserialize against the current registration
//! set: the registration is authoritative for the schedule and retry
//! delay, which lets deployments edit either without migrating state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::cron::{CronExpression, InvalidCronExpression};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error reported by a task's callback. Recorded as a failed attempt,
/// never rethrown out of the scheduler loop.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TaskFailure(pub String);

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The work a task performs when its schedule (or pending retry) fires.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self) -> Result<(), TaskFailure>;
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidRegistration {
    #[error(transparent)]
    Cron(#[from] InvalidCronExpression),

    #[error("task {name}: retry delay must not be negative")]
    NegativeRetryDelay { name: String },
}

/// A task as registered at startup: unique name, schedule, callback and
/// the delay before a failed execution is retried.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub cron: CronExpression,
    pub retry_delay: Duration,
    pub action: Arc<dyn TaskAction>,
}

impl Registration {
    pub fn new(
        name: impl Into<String>,
        cron_text: &str,
        retry_delay: Duration,
        action: Arc<dyn TaskAction>,
    ) -> Result<Self, InvalidRegistration> {
        let name = name.into();
        let cron = CronExpression::parse(cron_text)?;
        if retry_delay < Duration::zero() {
            return Err(InvalidRegistration::NegativeRetryDelay { name });
        }
        Ok(Self {
            name,
            cron,
            retry_delay,
            action,
        })
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("cron", &self.cron.text())
            .field("retry_delay_ms", &self.retry_delay.num_milliseconds())
            .finish()
    }
}

/// Registrations keyed by task name.
pub type RegistrationMap = HashMap<String, Registration>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The persisted trace of one registered task.
///
/// Invariants: `last_attempt_time` is the max of the success and failure
/// stamps; `pending_retry_until` is present exactly when the latest
/// attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub name: String,
    pub cron_expression: String,
    pub retry_delay_ms: i64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub pending_retry_until: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A fresh record for a registration that has never run.
    pub fn for_registration(registration: &Registration) -> Self {
        Self {
            name: registration.name.clone(),
            cron_expression: registration.cron.text().to_string(),
            retry_delay_ms: registration.retry_delay.num_milliseconds(),
            last_success_time: None,
            last_failure_time: None,
            last_attempt_time: None,
            pending_retry_until: None,
        }
    }
}

pub(crate) fn to_iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Serialize for TaskRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let optional = [
            ("lastSuccessTime", &self.last_success_time),
            ("lastFailureTime", &self.last_failure_time),
            ("lastAttemptTime", &self.last_attempt_time),
            ("pendingRetryUntil", &self.pending_retry_until),
        ];
        let present = optional.iter().filter(|(_, v)| v.is_some()).count();
        let mut record = serializer.serialize_struct("TaskRecord", 3 + present)?;
        record.serialize_field("name", &self.name)?;
        record.serialize_field("cronExpression", &self.cron_expression)?;
        record.serialize_field("retryDelayMs", &self.retry_delay_ms)?;
        for (key, value) in optional {
            match value {
                Some(t) => record.serialize_field(key, &to_iso(t))?,
                None => record.skip_field(key)?,
            }
        }
        record.end()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One bad persisted record. Collected, logged, and dropped; a corrupt
/// record never takes the rest of the document with it.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TaskDecodeError {
    #[error("task record is not an object")]
    InvalidStructure,

    #[error("task record: missing field {field}")]
    MissingField { field: &'static str },

    #[error("task {name:?}: field {field} must be {expected}")]
    InvalidType {
        name: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("task {name:?}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Decode one persisted task record against the current registrations.
///
/// The registration is authoritative for `cronExpression` and
/// `retryDelayMs`; persisted values only have to typecheck. Unknown
/// fields are dropped.
pub fn decode_task(
    value: &serde_json::Value,
    registrations: &RegistrationMap,
) -> Result<TaskRecord, TaskDecodeError> {
    let object = value
        .as_object()
        .ok_or(TaskDecodeError::InvalidStructure)?;

    let name = match object.get("name") {
        None => return Err(TaskDecodeError::MissingField { field: "name" }),
        Some(serde_json::Value::String(name)) => name.clone(),
        Some(_) => {
            return Err(TaskDecodeError::InvalidType {
                name: String::new(),
                field: "name",
                expected: "a string",
            })
        }
    };

    match object.get("retryDelayMs") {
        None => return Err(TaskDecodeError::MissingField { field: "retryDelayMs" }),
        Some(value) => match value.as_i64() {
            Some(ms) if ms >= 0 => ms,
            Some(ms) => {
                return Err(TaskDecodeError::InvalidValue {
                    name,
                    reason: format!("retryDelayMs {ms} is negative"),
                })
            }
            None => {
                return Err(TaskDecodeError::InvalidType {
                    name,
                    field: "retryDelayMs",
                    expected: "a non-negative integer",
                })
            }
        },
    };

    if let Some(value) = object.get("cronExpression") {
        // May be absent; when present it only has to be a string. The
        // registration's expression wins either way.
        if !value.is_string() {
            return Err(TaskDecodeError::InvalidType {
                name,
                field: "cronExpression",
                expected: "a string",
            });
        }
    }

    let registration =
        registrations
            .get(&name)
            .ok_or_else(|| TaskDecodeError::InvalidValue {
                name: name.clone(),
                reason: "not found".to_string(),
            })?;

    let timestamp = |field: &'static str| -> Result<Option<DateTime<Utc>>, TaskDecodeError> {
        match object.get(field) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| TaskDecodeError::InvalidValue {
                    name: name.clone(),
                    reason: format!("field {field}: {e}"),
                }),
            Some(_) => Err(TaskDecodeError::InvalidType {
                name: name.clone(),
                field,
                expected: "an ISO-8601 string",
            }),
        }
    };

    Ok(TaskRecord {
        name: name.clone(),
        cron_expression: registration.cron.text().to_string(),
        retry_delay_ms: registration.retry_delay.num_milliseconds(),
        last_success_time: timestamp("lastSuccessTime")?,
        last_failure_time: timestamp("lastFailureTime")?,
        last_attempt_time: timestamp("lastAttemptTime")?,
        pending_retry_until: timestamp("pendingRetryUntil")?,
    })
}
