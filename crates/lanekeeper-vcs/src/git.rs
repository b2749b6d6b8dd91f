//! Git driver: per-repository mirrors and subprocess plumbing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use lanekeeper_core::progress::ProgressLog;

use crate::revlist::{CommitEntry, parse_rev_list};
use crate::{CommitIdentity, LogRange, VcsDriver, VcsError, VcsResult};

/// Clones can be slow; everything else gets the short timeout.
const CLONE_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The default upper bound when a lane configures none.
pub const DEFAULT_MAX_REVISION: &str = "remotes/origin/master";

/// Git implementation of [`VcsDriver`].
///
/// Maintains one `--no-checkout` mirror per repository URL under
/// `mirror_root`, content-addressed by the URL (not by lane). Concurrent use
/// of one mirror is prevented by the scheduler queue's per-repository mutual
/// exclusion, not here.
pub struct GitDriver {
    mirror_root: PathBuf,
}

impl GitDriver {
    pub fn new(mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
        }
    }

    /// The mirror directory for a repository URL.
    pub fn mirror_path(&self, repository: &str) -> PathBuf {
        let hash = format!("{:x}", md5::compute(repository));
        self.mirror_root.join(hash)
    }

    async fn run_git(
        &self,
        operation: &str,
        dir: &Path,
        args: &[&str],
        timeout: Duration,
    ) -> VcsResult<std::process::Output> {
        debug!(operation, dir = %dir.display(), ?args, "running git");

        let child = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future on timeout must not leave git running.
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| VcsError::Timeout {
                operation: operation.to_string(),
                minutes: timeout.as_secs() / 60,
            })??;

        if !output.status.success() {
            return Err(VcsError::Failed {
                operation: operation.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output)
    }
}

#[async_trait]
impl VcsDriver for GitDriver {
    async fn fetch(&self, repository: &str, log: &dyn ProgressLog) -> VcsResult<()> {
        let mirror = self.mirror_path(repository);
        tokio::fs::create_dir_all(&mirror).await?;

        let (operation, args, timeout): (_, Vec<&str>, _) = if mirror.join(".git").exists() {
            ("git fetch", vec!["fetch", "--progress"], COMMAND_TIMEOUT)
        } else {
            (
                "git clone",
                vec!["clone", "--progress", "--no-checkout", repository, "."],
                CLONE_TIMEOUT,
            )
        };

        log.log(&format!(
            "Fetching git repository '{}' in {}",
            repository,
            mirror.display()
        ));
        info!(repository, mirror = %mirror.display(), operation, "updating mirror");

        let output = self.run_git(operation, &mirror, &args, timeout).await?;
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            if !line.trim().is_empty() {
                log.log(&format!("{}: {}", repository, line));
            }
        }

        log.log(&format!("Fetched git repository '{}'", repository));
        Ok(())
    }

    async fn commit_log(
        &self,
        repository: &str,
        range: &LogRange,
        log: &dyn ProgressLog,
    ) -> VcsResult<Vec<CommitEntry>> {
        let mirror = self.mirror_path(repository);

        let max = if range.max_revision.is_empty() {
            DEFAULT_MAX_REVISION
        } else {
            range.max_revision.as_str()
        };
        let span = match &range.min_revision {
            Some(min) if !min.is_empty() => format!("{}^..{}", min, max),
            _ => max.to_string(),
        };

        // rev-list emits newest first; --reverse restores commit order so
        // revisions are imported oldest first.
        let mut args = vec!["rev-list", "--reverse", "--header"];
        if range.first_parent {
            args.push("--first-parent");
        }
        args.push(&span);

        log.log(&format!(
            "Retrieving log for '{}', range '{}'",
            repository, span
        ));

        let output = self
            .run_git("git rev-list", &mirror, &args, COMMAND_TIMEOUT)
            .await?;
        let entries = parse_rev_list(&String::from_utf8_lossy(&output.stdout));
        log.log(&format!("Got {} log records for '{}'", entries.len(), repository));
        Ok(entries)
    }

    async fn changed_files(&self, repository: &str, revision: &str) -> VcsResult<Vec<String>> {
        let mirror = self.mirror_path(repository);
        let output = self
            .run_git(
                "git show",
                &mirror,
                &["show", "--name-only", "--pretty=format:", revision],
                COMMAND_TIMEOUT,
            )
            .await?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn commit_identity(
        &self,
        repository: &str,
        revision: &str,
    ) -> VcsResult<CommitIdentity> {
        let mirror = self.mirror_path(repository);
        let output = self
            .run_git(
                "git log",
                &mirror,
                &["log", "-1", "--pretty=format:%aE%n%aN%n%cE%n%cN", revision],
                COMMAND_TIMEOUT,
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let mut next = || lines.next().unwrap_or_default().to_string();
        let identity = CommitIdentity {
            author_email: next(),
            author_name: next(),
            committer_email: next(),
            committer_name: next(),
        };

        if identity.author_email.is_empty() {
            warn!(repository, revision, "no identity found for commit");
        }
        Ok(identity)
    }
}
