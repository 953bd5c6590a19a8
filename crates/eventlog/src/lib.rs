//! Append-only, git-backed event stream with copied binary assets.
//!
//! Events are JSON lines in `events.jsonl` at the root of a working
//! repository; binary assets travel with their event under
//! `assets/<event-id>/`. Every append is one gitstore transaction, so a
//! reader of the repository either sees an event together with its assets
//! or neither. Existing lines are never rewritten.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use vd_domain::Clock;
use vd_gitstore::{
    fs, transaction_with_retry, ExistingFile, Git, GitStoreLocation, RetryOptions,
    StoreError,
};

pub const LOG_FILE: &str = "events.jsonl";
pub const ASSETS_DIR: &str = "assets";

/// A binary file copied into the repository alongside its event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    /// File name under `assets/<event-id>/`.
    pub name: String,
    /// SHA-256 of the copied contents, hex encoded.
    pub sha256: String,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub assets: Vec<AssetRef>,
}

/// The event log: every append is one retried transaction against the
/// working repository (and its remote mirror, when configured).
pub struct EventLogStore {
    clock: Arc<dyn Clock>,
    git: Git,
    location: GitStoreLocation,
    retry: RetryOptions,
}

impl EventLogStore {
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

    /// Record one event, copying its assets into the repository.
    ///
    /// Returns the event as persisted, with the asset digests filled in.
    pub async fn append(
        &self,
        kind: &str,
        payload: serde_json::Value,
        assets: &[ExistingFile],
    ) -> Result<Event, StoreError> {
        let id = Uuid::new_v4();
        let recorded_at = self.clock.now();

        let event = transaction_with_retry(&self.git, &self.location, &self.retry, |store| {
            let payload = payload.clone();
            async move {
                let mut refs = Vec::with_capacity(assets.len());
                if !assets.is_empty() {
                    let asset_dir =
                        store.work_tree().join(ASSETS_DIR).join(id.to_string());
                    fs::create_directory(&asset_dir).await?;
                    for asset in assets {
                        let name = asset.file_name().to_string_lossy().into_owned();
                        fs::copy_file(asset, &asset_dir.join(&name)).await?;
                        refs.push(AssetRef {
                            name,
                            sha256: digest_file(asset.path()).await?,
                        });
                    }
                }

                let event = Event {
                    id,
                    recorded_at,
                    kind: kind.to_string(),
                    payload,
                    assets: refs,
                };
                if append_line(store.work_tree(), &event).await? {
                    store.commit("Event log update").await?;
                }
                Ok(event)
            }
        })
        .await?;

        tracing::info!(
            event_id = %event.id,
            kind = %event.kind,
            assets = event.assets.len(),
            "event recorded"
        );
        Ok(event)
    }
}

async fn digest_file(path: &Path) -> Result<String, StoreError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Append the event as one JSON line, leaving existing lines untouched.
///
/// An append replayed after a failure whose push actually landed may find
/// its line already present; the event id keeps the operation idempotent.
/// Returns whether the file changed, so the caller knows to skip the
/// commit when it did not.
async fn append_line(work_tree: &Path, event: &Event) -> Result<bool, StoreError> {
    let path = work_tree.join(LOG_FILE);
    let mut log = if fs::exists(&path).await {
        fs::read_text(&path).await?
    } else {
        String::new()
    };
    if log.contains(&event.id.to_string()) {
        return Ok(false);
    }
    let line = serde_json::to_string(event)
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
    log.push_str(&line);
    log.push('\n');
    fs::write_text(&path, &log).await?;
    Ok(true)
}
