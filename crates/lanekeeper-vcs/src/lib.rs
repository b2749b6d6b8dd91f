//! Source control drivers.
//!
//! The scheduler talks to source control through [`VcsDriver`]; adding
//! another VCS means adding another implementation, not branching on a type
//! tag. The only concrete implementation is [`git::GitDriver`].

pub mod git;
pub mod revlist;

use async_trait::async_trait;
use thiserror::Error;

use lanekeeper_core::progress::ProgressLog;

pub use git::GitDriver;
pub use revlist::{CommitEntry, parse_rev_list};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} did not finish within {minutes} minutes")]
    Timeout { operation: String, minutes: u64 },

    #[error("{operation} failed (exit code {code:?}): {stderr}")]
    Failed {
        operation: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub type VcsResult<T> = std::result::Result<T, VcsError>;

/// Bounds for a commit log request.
#[derive(Debug, Clone, Default)]
pub struct LogRange {
    /// Exclusive lower bound; `None` means "from the beginning of history".
    pub min_revision: Option<String>,
    /// Upper bound ref or hash.
    pub max_revision: String,
    /// Skip merge-commit second parents.
    pub first_parent: bool,
}

/// Author and committer identity of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

/// A source control backend.
///
/// Failures are per-repository, per-cycle events: callers treat them as "no
/// log available this cycle" and retry on the next trigger.
#[async_trait]
pub trait VcsDriver: Send + Sync {
    /// Ensure the local mirror for a repository exists and is up to date
    /// (clone-or-fetch). Bounded by a hard timeout; the subprocess is killed
    /// on expiry.
    async fn fetch(&self, repository: &str, log: &dyn ProgressLog) -> VcsResult<()>;

    /// Commit entries in the given range, oldest first.
    async fn commit_log(
        &self,
        repository: &str,
        range: &LogRange,
        log: &dyn ProgressLog,
    ) -> VcsResult<Vec<CommitEntry>>;

    /// File paths touched by one commit, for commit-filter evaluation.
    async fn changed_files(&self, repository: &str, revision: &str) -> VcsResult<Vec<String>>;

    /// Author/committer identity of one commit.
    async fn commit_identity(&self, repository: &str, revision: &str)
    -> VcsResult<CommitIdentity>;
}
