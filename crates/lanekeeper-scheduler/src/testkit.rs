//! Scripted collaborators for scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use lanekeeper_core::progress::ProgressLog;
use lanekeeper_vcs::{CommitEntry, CommitIdentity, LogRange, VcsDriver, VcsError, VcsResult};

pub(crate) fn commit(hash: &str, timestamp: &str) -> CommitEntry {
    CommitEntry {
        revision: hash.to_string(),
        author: Some("test author".to_string()),
        timestamp: Some(timestamp.to_string()),
        message: format!("commit {}", hash),
    }
}

/// A [`VcsDriver`] that replays canned data.
#[derive(Default)]
pub(crate) struct ScriptedVcs {
    commits: HashMap<String, Vec<CommitEntry>>,
    files: HashMap<(String, String), Vec<String>>,
    fetch_failures: HashSet<String>,
    log_failures: HashSet<String>,
    fetches: AtomicUsize,
}

impl ScriptedVcs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_commits(mut self, repository: &str, commits: Vec<CommitEntry>) -> Self {
        self.commits.insert(repository.to_string(), commits);
        self
    }

    pub(crate) fn with_files(mut self, repository: &str, revision: &str, files: Vec<&str>) -> Self {
        self.files.insert(
            (repository.to_string(), revision.to_string()),
            files.into_iter().map(String::from).collect(),
        );
        self
    }

    pub(crate) fn with_fetch_failure(mut self, repository: &str) -> Self {
        self.fetch_failures.insert(repository.to_string());
        self
    }

    pub(crate) fn with_log_failure(mut self, repository: &str) -> Self {
        self.log_failures.insert(repository.to_string());
        self
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn failed(&self, operation: &str) -> VcsError {
        VcsError::Failed {
            operation: operation.to_string(),
            code: Some(128),
            stderr: "scripted failure".to_string(),
        }
    }
}

#[async_trait]
impl VcsDriver for ScriptedVcs {
    async fn fetch(&self, repository: &str, _log: &dyn ProgressLog) -> VcsResult<()> {
        if self.fetch_failures.contains(repository) {
            return Err(self.failed("git fetch"));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_log(
        &self,
        repository: &str,
        _range: &LogRange,
        _log: &dyn ProgressLog,
    ) -> VcsResult<Vec<CommitEntry>> {
        if self.log_failures.contains(repository) {
            return Err(self.failed("git rev-list"));
        }
        Ok(self.commits.get(repository).cloned().unwrap_or_default())
    }

    async fn changed_files(&self, repository: &str, revision: &str) -> VcsResult<Vec<String>> {
        Ok(self
            .files
            .get(&(repository.to_string(), revision.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn commit_identity(
        &self,
        _repository: &str,
        _revision: &str,
    ) -> VcsResult<CommitIdentity> {
        Ok(CommitIdentity {
            author_name: "test author".to_string(),
            author_email: "author@example.com".to_string(),
            committer_name: "test committer".to_string(),
            committer_email: "committer@example.com".to_string(),
        })
    }
}
