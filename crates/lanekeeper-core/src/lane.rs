//! Lanes, hosts, and build commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Source control kind of a lane's repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceControl {
    Git,
    Svn,
}

impl std::fmt::Display for SourceControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceControl::Git => write!(f, "git"),
            SourceControl::Svn => write!(f, "svn"),
        }
    }
}

impl std::str::FromStr for SourceControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(SourceControl::Git),
            "svn" => Ok(SourceControl::Svn),
            other => Err(format!("unknown source control: {}", other)),
        }
    }
}

/// A build pipeline: one or more repositories, a set of commands, and the
/// hosts enabled for it via [`HostLane`] rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub id: EntityId,
    pub name: String,
    /// Comma-joined repository URL list as configured by the operator.
    pub repository: String,
    /// Comma-joined per-repository minimum revision bounds (may be shorter
    /// than the repository list; normalization pads it).
    pub min_revision: String,
    /// Comma-joined per-repository maximum revision bounds.
    pub max_revision: String,
    pub source_control: SourceControl,
    /// Commands are inherited from ancestors walking this chain.
    pub parent_lane_id: Option<EntityId>,
    pub enabled: bool,
    /// Hash of the most recently imported revision; the incremental-update
    /// cursor.
    pub last_revision: String,
    /// `ExcludeAllExcept:`/`IncludeAllExcept:` glob filter over changed
    /// paths, empty for none.
    pub commit_filter: String,
    /// Whether `rev-list` traverses merge-commit second parents.
    pub traverse_merge: bool,
}

/// One repository reference of a lane with its revision bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneRepository {
    pub url: String,
    pub min_revision: Option<String>,
    pub max_revision: Option<String>,
}

impl Lane {
    /// The lane's repositories with min/max revision bounds aligned to the
    /// repository list. Shorter bound lists are padded by repeating their
    /// last element.
    pub fn repositories(&self) -> Vec<LaneRepository> {
        let urls = split_list(&self.repository);
        let mins = pad_list(split_list(&self.min_revision), urls.len());
        let maxs = pad_list(split_list(&self.max_revision), urls.len());

        urls.into_iter()
            .enumerate()
            .map(|(i, url)| LaneRepository {
                url,
                min_revision: mins.get(i).cloned().flatten(),
                max_revision: maxs.get(i).cloned().flatten(),
            })
            .collect()
    }
}

fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn pad_list(items: Vec<String>, len: usize) -> Vec<Option<String>> {
    let mut out: Vec<Option<String>> = items.into_iter().map(Some).collect();
    while out.len() < len {
        out.push(out.last().cloned().unwrap_or(None));
    }
    out
}

/// A build agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: EntityId,
    pub name: String,
}

/// Enables (or disables) a lane on a host. Only enabled pairs receive work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLane {
    pub id: EntityId,
    pub host_id: EntityId,
    pub lane_id: EntityId,
    pub enabled: bool,
}

/// A named build step belonging to a lane. Child lanes inherit their
/// ancestors' commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: EntityId,
    pub lane_id: EntityId,
    pub name: String,
    /// Execution order within the lane.
    pub sequence: i32,
}

/// One imported source-control commit, scoped to a lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: EntityId,
    pub lane_id: EntityId,
    /// Commit hash. Unique per lane.
    pub revision: String,
    pub author: String,
    /// Commit date; the importer guarantees uniqueness per lane within an
    /// import batch.
    pub date: DateTime<Utc>,
    /// Commit message, empty if none was recorded.
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane_with(repository: &str, min: &str, max: &str) -> Lane {
        Lane {
            id: EntityId::new(),
            name: "test".to_string(),
            repository: repository.to_string(),
            min_revision: min.to_string(),
            max_revision: max.to_string(),
            source_control: SourceControl::Git,
            parent_lane_id: None,
            enabled: true,
            last_revision: String::new(),
            commit_filter: String::new(),
            traverse_merge: false,
        }
    }

    #[test]
    fn repositories_align_bounds_with_urls() {
        let lane = lane_with("git://a,git://b", "r1,r2", "m1,m2");
        let repos = lane.repositories();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].url, "git://a");
        assert_eq!(repos[0].min_revision.as_deref(), Some("r1"));
        assert_eq!(repos[1].max_revision.as_deref(), Some("m2"));
    }

    #[test]
    fn shorter_bound_lists_are_padded_with_last_element() {
        let lane = lane_with("git://a,git://b,git://c", "r1", "");
        let repos = lane.repositories();
        assert_eq!(repos.len(), 3);
        assert_eq!(repos[1].min_revision.as_deref(), Some("r1"));
        assert_eq!(repos[2].min_revision.as_deref(), Some("r1"));
        assert_eq!(repos[2].max_revision, None);
    }

    #[test]
    fn empty_entries_are_dropped() {
        let lane = lane_with("git://a,,git://b,", "", "");
        assert_eq!(lane.repositories().len(), 2);
    }
}
