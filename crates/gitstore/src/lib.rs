//! Git-backed transactional storage.
//!
//! A [`transaction`] clones a local working repository into a disposable
//! work-tree, hands the work-tree to the caller's transform, and pushes the
//! resulting commits back, atomically from the point of view of any other
//! reader of the working repository. [`transaction_with_retry`] re-runs the
//! whole transform when the final push loses a race.

pub mod error;
pub mod fs;
pub mod git;
pub mod proc;
pub mod retry;
pub mod store;

pub use error::{RunnerError, StoreError};
pub use fs::ExistingFile;
pub use git::Git;
pub use proc::{CommandOutput, CommandRunner};
pub use retry::{with_retry, Attempt, RetryOptions};
pub use store::{
    transaction, transaction_with_retry, GitStore, GitStoreLocation, InitialState,
};
