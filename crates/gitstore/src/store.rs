//! The transaction engine.
//!
//! Every transaction works on a disposable shallow clone of the local
//! working repository. Commits made by the transform only become visible
//! when the single final push back into the working repository succeeds;
//! the clone is deleted whatever happens. A configured remote mirror is
//! brought up to date lazily, by the pull-then-push re-anchor at the start
//! of the next transaction, so one attempt never has two pushes that could
//! leave it half-applied.

use std::future::Future;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use vd_domain::RemoteLocation;

use crate::error::StoreError;
use crate::fs;
use crate::git::Git;
use crate::retry::{with_retry, Attempt, RetryOptions};

/// How to bring up the working repository when it does not exist yet.
#[derive(Debug, Clone)]
pub enum InitialState {
    /// Start from a fresh empty history.
    Empty,
    /// Clone from (and mirror back to) a remote.
    Remote(RemoteLocation),
}

/// A local working repository and its bring-up policy.
#[derive(Debug, Clone)]
pub struct GitStoreLocation {
    pub working_path: PathBuf,
    pub initial: InitialState,
}

impl GitStoreLocation {
    pub fn empty(working_path: impl Into<PathBuf>) -> Self {
        Self {
            working_path: working_path.into(),
            initial: InitialState::Empty,
        }
    }

    pub fn remote(working_path: impl Into<PathBuf>, remote: RemoteLocation) -> Self {
        Self {
            working_path: working_path.into(),
            initial: InitialState::Remote(remote),
        }
    }
}

/// Handle given to a transaction's transform.
#[derive(Debug, Clone)]
pub struct GitStore {
    git: Git,
    work_tree: PathBuf,
}

impl GitStore {
    /// The transaction's private checkout. Stable for the whole attempt.
    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Stage all changes in the work-tree and record a commit. A transform
    /// may commit any number of times.
    pub async fn commit(&self, message: &str) -> Result<(), StoreError> {
        self.git
            .commit_all(&self.work_tree, message)
            .await
            .map_err(StoreError::from)
    }
}

/// Make sure the working repository exists and sits on the remote tip.
async fn ensure_working_repository(
    git: &Git,
    location: &GitStoreLocation,
) -> Result<(), StoreError> {
    let path = &location.working_path;
    let initialized = fs::exists(&path.join(".git").join("index")).await;

    if !initialized {
        match &location.initial {
            InitialState::Empty => {
                git.init(path).await.map_err(|e| StoreError::WorkingRepository {
                    path: path.clone(),
                    reason: format!("init failed: {e}"),
                })?;
            }
            InitialState::Remote(remote) => {
                git.clone_shallow(&remote.url, path).await.map_err(|e| {
                    StoreError::WorkingRepository {
                        path: path.clone(),
                        reason: format!("clone from {} failed: {e}", remote.url),
                    }
                })?;
                git.make_pushable(path).await.map_err(|e| {
                    StoreError::WorkingRepository {
                        path: path.clone(),
                        reason: format!("configuring clone failed: {e}"),
                    }
                })?;
            }
        }
        return Ok(());
    }

    // Re-anchor an existing mirror to the remote tip. A purely local
    // repository has no remote to re-anchor against.
    if let InitialState::Remote(_) = &location.initial {
        git.pull(path).await.map_err(|e| StoreError::WorkingRepository {
            path: path.clone(),
            reason: format!("pull failed: {e}"),
        })?;
        git.push(path).await?;
    }
    Ok(())
}

/// Run one transaction attempt.
///
/// The transform receives a [`GitStore`] over a disposable clone; its
/// commits are pushed back only after it returns successfully. Push
/// rejection surfaces as [`StoreError::Push`]; pair with
/// [`transaction_with_retry`] when racing other writers.
pub async fn transaction<T, F, Fut>(
    git: &Git,
    location: &GitStoreLocation,
    mut transform: F,
) -> Result<T, StoreError>
where
    F: FnMut(GitStore) -> Fut + Send,
    Fut: Future<Output = Result<T, StoreError>> + Send,
    T: Send,
{
    ensure_working_repository(git, location).await?;

    // Deleted on drop, success or failure.
    let scratch = fs::create_temp_dir()?;
    let work_tree = scratch.path().join("work-tree");
    git.clone_shallow(&location.working_path.display().to_string(), &work_tree)
        .await?;

    let store = GitStore {
        git: git.clone(),
        work_tree: work_tree.clone(),
    };
    let value = transform(store).await?;

    // The one push of the attempt. The remote mirror picks these commits
    // up at the next transaction's re-anchor.
    git.push(&work_tree).await?;
    Ok(value)
}

/// [`transaction`] wrapped in the retry coordinator.
///
/// Only [`StoreError::Push`] is retried. A rejected attempt leaves nothing
/// of the transform visible (its work-tree is discarded), so the transform
/// simply runs again against a freshly re-anchored clone.
pub async fn transaction_with_retry<T, F, Fut>(
    git: &Git,
    location: &GitStoreLocation,
    options: &RetryOptions,
    mut transform: F,
) -> Result<T, StoreError>
where
    F: FnMut(GitStore) -> Fut + Send,
    Fut: Future<Output = Result<T, StoreError>> + Send,
    T: Send,
{
    let txn = Uuid::new_v4();
    let max_attempts = options.max_attempts.max(1);
    let working_path = location.working_path.display().to_string();
    let transform = std::sync::Arc::new(parking_lot::Mutex::new(transform));

    let result = with_retry("gitstore transaction", options, async |attempt| {
        let transform = transform.clone();
        let mut transform = move |store: GitStore| (*transform.lock())(store);
        match transaction(git, location, &mut transform).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(
                        txn = %txn,
                        attempt,
                        working_path = %working_path,
                        "transaction succeeded on attempt {attempt} after previous failures"
                    );
                } else {
                    tracing::debug!(txn = %txn, working_path = %working_path, "transaction committed");
                }
                Ok(Attempt::Done(value))
            }
            Err(err) if err.is_push() && attempt < max_attempts => {
                tracing::warn!(
                    txn = %txn,
                    attempt,
                    max_attempts,
                    working_path = %working_path,
                    error = %err,
                    "push rejected; retrying transaction"
                );
                Ok(Attempt::Retry)
            }
            Err(err) => Err(err),
        }
    })
    .await;

    if let Err(err) = &result {
        tracing::error!(
            txn = %txn,
            max_attempts,
            working_path = %working_path,
            error = %err,
            "transaction failed"
        );
    }
    result
}
