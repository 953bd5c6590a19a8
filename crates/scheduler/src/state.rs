//! The persisted runtime-state document.
//!
//! `state.json` lives at the root of a git-backed working repository and
//! is only ever written through a gitstore transaction. Reading is
//! forgiving: a corrupt task record is collected and dropped, a corrupt
//! document is discarded whole, and older schema versions upgrade
//! silently. Writing is exact: version 2, tab-indented pretty JSON, tasks
//! in ascending name order, and no commit at all when the bytes on disk
//! already match.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use vd_domain::Clock;
use vd_gitstore::{
    fs, transaction_with_retry, Git, GitStore, GitStoreLocation, RetryOptions, StoreError,
};

use crate::task::{decode_task, to_iso, RegistrationMap, TaskDecodeError, TaskRecord};

pub const STATE_FILE: &str = "state.json";
pub const CURRENT_VERSION: u64 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The runtime-state document. The schema version is implied: documents
/// always serialize as the current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    /// Process boot time when the state was first written.
    pub start_time: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

impl RuntimeState {
    pub fn make_default(now: DateTime<Utc>) -> Self {
        Self {
            start_time: now,
            tasks: Vec::new(),
        }
    }
}

impl Serialize for RuntimeState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tasks: Vec<&TaskRecord> = self.tasks.iter().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));

        let mut doc = serializer.serialize_struct("RuntimeState", 3)?;
        doc.serialize_field("version", &CURRENT_VERSION)?;
        doc.serialize_field("startTime", &to_iso(&self.start_time))?;
        doc.serialize_field("tasks", &tasks)?;
        doc.end()
    }
}

/// Serialize the document the way it is stored: tab-indented pretty JSON
/// with a trailing newline.
pub fn serialize_document(state: &RuntimeState) -> Result<String, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    state.serialize(&mut serializer)?;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    text.push('\n');
    Ok(text)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of decoding a document: the state (unless its top-level
/// structure was invalid) plus every per-record error encountered.
#[derive(Debug, Default)]
pub struct DecodedState {
    pub state: Option<RuntimeState>,
    pub task_errors: Vec<TaskDecodeError>,
}

/// Decode a document against the current registrations.
///
/// Only a structurally invalid document (bad JSON, missing/bad top-level
/// fields) is discarded whole; bad task records are collected in
/// `task_errors` and decoding continues.
pub fn decode_document(raw: &str, registrations: &RegistrationMap) -> DecodedState {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, "runtime state is not valid JSON; discarding");
            return DecodedState::default();
        }
    };
    let Some(object) = value.as_object() else {
        tracing::warn!("runtime state is not an object; discarding");
        return DecodedState::default();
    };

    let Some(version) = object.get("version").and_then(|v| v.as_u64()) else {
        tracing::warn!("runtime state has no integer version; discarding");
        return DecodedState::default();
    };
    if version < CURRENT_VERSION {
        tracing::info!(
            from = version,
            to = CURRENT_VERSION,
            "upgrading runtime state schema"
        );
    }

    let start_time = match object.get("startTime").and_then(|v| v.as_str()) {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => t.with_timezone(&Utc),
            Err(error) => {
                tracing::warn!(%error, "runtime state has an unreadable startTime; discarding");
                return DecodedState::default();
            }
        },
        None => {
            tracing::warn!("runtime state has no startTime; discarding");
            return DecodedState::default();
        }
    };

    let Some(raw_tasks) = object.get("tasks").and_then(|v| v.as_array()) else {
        tracing::warn!("runtime state has no tasks array; discarding");
        return DecodedState::default();
    };

    let mut tasks = Vec::with_capacity(raw_tasks.len());
    let mut task_errors = Vec::new();
    for raw_task in raw_tasks {
        match decode_task(raw_task, registrations) {
            Ok(record) => tasks.push(record),
            Err(error) => {
                tracing::warn!(%error, "dropping unreadable task record");
                task_errors.push(error);
            }
        }
    }

    DecodedState {
        state: Some(RuntimeState { start_time, tasks }),
        task_errors,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transaction view
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One transaction's view of the state document.
///
/// The raw file is read when the transaction opens; parsing happens once,
/// on first access.
pub struct StateTxn<'a> {
    registrations: &'a RegistrationMap,
    now: DateTime<Utc>,
    raw: Option<String>,
    parsed: Option<Option<RuntimeState>>,
    task_errors: Vec<TaskDecodeError>,
    new_state: Option<RuntimeState>,
}

impl<'a> StateTxn<'a> {
    fn new(registrations: &'a RegistrationMap, now: DateTime<Utc>, raw: Option<String>) -> Self {
        Self {
            registrations,
            now,
            raw,
            parsed: None,
            task_errors: Vec::new(),
            new_state: None,
        }
    }

    /// Queue a new state to be committed when the transaction closes.
    pub fn set_state(&mut self, state: RuntimeState) {
        self.new_state = Some(state);
    }

    /// The queued state, if any.
    pub fn new_state(&self) -> Option<&RuntimeState> {
        self.new_state.as_ref()
    }

    /// The state on disk; `None` when the file is missing or corrupt.
    pub fn existing_state(&mut self) -> Option<&RuntimeState> {
        if self.parsed.is_none() {
            let decoded = match &self.raw {
                None => None,
                Some(raw) => {
                    let decoded = decode_document(raw, self.registrations);
                    self.task_errors = decoded.task_errors;
                    decoded.state
                }
            };
            self.parsed = Some(decoded);
        }
        self.parsed.as_ref().and_then(|state| state.as_ref())
    }

    /// Queued state, else existing state, else a fresh default.
    pub fn current_state(&mut self) -> RuntimeState {
        if let Some(state) = &self.new_state {
            return state.clone();
        }
        if let Some(state) = self.existing_state() {
            return state.clone();
        }
        RuntimeState::make_default(self.now)
    }

    /// Per-record errors collected while parsing the existing state.
    pub fn task_errors(&self) -> &[TaskDecodeError] {
        &self.task_errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime-state persistence: every update is one retried gitstore
/// transaction over the working repository holding `state.json`.
pub struct StateStorage {
    clock: Arc<dyn Clock>,
    git: Git,
    location: GitStoreLocation,
    retry: RetryOptions,
}

impl StateStorage {
    pub fn new(clock: Arc<dyn Clock>, git: Git, location: GitStoreLocation) -> Self {
        Self {
            clock,
            git,
            location,
            retry: RetryOptions::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Run `f` against the state document inside one transaction.
    ///
    /// When `f` queues a new state it is serialized and committed as
    /// `"Runtime state update"`, unless the serialized form is
    /// byte-identical to the file on disk, in which case nothing is
    /// committed. `f` may run more than once if the commit loses a push
    /// race.
    pub fn update<'a, T, F>(
        &'a self,
        registrations: &'a RegistrationMap,
        f: F,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>
    where
        T: Send + 'a,
        F: FnMut(&mut StateTxn) -> T + Send + 'a,
    {
        Box::pin(async move {
            let f = Arc::new(parking_lot::Mutex::new(f));
            let clock = &self.clock;
            transaction_with_retry(&self.git, &self.location, &self.retry, move |store| {
                let f = f.clone();
                async move {
                    let value = apply_update(&store, clock.now(), registrations, &f).await?;
                    Ok(value)
                }
            })
            .await
        })
    }
}

async fn apply_update<T, F>(
    store: &GitStore,
    now: DateTime<Utc>,
    registrations: &RegistrationMap,
    f: &parking_lot::Mutex<F>,
) -> Result<T, StoreError>
where
    F: FnMut(&mut StateTxn) -> T,
{
    let path = store.work_tree().join(STATE_FILE);
    let raw = if fs::exists(&path).await {
        Some(fs::read_text(&path).await?)
    } else {
        None
    };

    let mut txn = StateTxn::new(registrations, now, raw);
    let value = {
        let mut f = f.lock();
        (*f)(&mut txn)
    };

    if let Some(new_state) = txn.new_state() {
        let serialized = serialize_document(new_state)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        if txn.raw.as_deref() != Some(serialized.as_str()) {
            fs::write_text(&path, &serialized).await?;
            store.commit("Runtime state update").await?;
        }
    }
    Ok(value)
}
