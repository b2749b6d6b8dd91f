//! The storage collaborator contract.
//!
//! The scheduler only assumes a queryable, transactional store with these
//! operations; conditional inserts must be idempotent (a duplicate-insert
//! race is absorbed, not surfaced) and multi-statement operations atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lanekeeper_core::dependency::LaneDependency;
use lanekeeper_core::lane::{Command, Host, HostLane, Lane, Revision, SourceControl};
use lanekeeper_core::work::{RevisionWork, Work, WorkFile};
use lanekeeper_core::{DependencyCondition, EntityId, WorkState};

use crate::DbResult;

/// Parameters for creating a lane.
#[derive(Debug, Clone)]
pub struct NewLane {
    pub name: String,
    pub repository: String,
    pub min_revision: String,
    pub max_revision: String,
    pub source_control: SourceControl,
    pub parent_lane_id: Option<EntityId>,
    pub enabled: bool,
    pub commit_filter: String,
    pub traverse_merge: bool,
}

impl Default for NewLane {
    fn default() -> Self {
        Self {
            name: String::new(),
            repository: String::new(),
            min_revision: String::new(),
            max_revision: String::new(),
            source_control: SourceControl::Git,
            parent_lane_id: None,
            enabled: true,
            commit_filter: String::new(),
            traverse_merge: false,
        }
    }
}

/// Parameters for creating a lane dependency.
#[derive(Debug, Clone)]
pub struct NewDependency {
    pub lane_id: EntityId,
    pub dependent_lane_id: EntityId,
    pub dependent_host_id: Option<EntityId>,
    pub condition: DependencyCondition,
    pub filename: Option<String>,
}

/// One revision ready for import, already deduplicated and
/// timestamp-adjusted by the importer.
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub revision: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub log: String,
}

/// Work rows for one revision work plus its classification, flushed as one
/// self-consistent unit.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub revision_work_id: EntityId,
    pub command_ids: Vec<EntityId>,
    /// `DependencyNotFulfilled` when the lane has dependencies, else
    /// `NotDone`. Applied to the work rows and the revision work itself.
    pub state: WorkState,
}

impl WorkUnit {
    /// Statements this unit contributes to a batch (work inserts + the
    /// revision work state flip).
    pub fn statement_count(&self) -> usize {
        self.command_ids.len() + 1
    }
}

/// Operator-configured entities: lanes, hosts, enablement joins, commands,
/// dependency declarations.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn lanes(&self) -> DbResult<Vec<Lane>>;
    async fn hosts(&self) -> DbResult<Vec<Host>>;
    async fn host_lanes(&self) -> DbResult<Vec<HostLane>>;
    async fn commands(&self) -> DbResult<Vec<Command>>;
    async fn dependencies(&self) -> DbResult<Vec<LaneDependency>>;

    async fn create_lane(&self, lane: NewLane) -> DbResult<Lane>;
    async fn create_host(&self, name: &str) -> DbResult<Host>;
    async fn create_host_lane(
        &self,
        host_id: EntityId,
        lane_id: EntityId,
        enabled: bool,
    ) -> DbResult<HostLane>;
    async fn create_command(&self, lane_id: EntityId, name: &str, sequence: i32)
    -> DbResult<Command>;
    async fn create_dependency(&self, dependency: NewDependency) -> DbResult<LaneDependency>;
}

/// Imported revisions and the per-lane incremental cursor.
#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Revision hashes already imported for a lane.
    async fn revision_hashes(&self, lane_id: EntityId) -> DbResult<Vec<String>>;

    async fn revisions_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<Revision>>;

    /// Conditionally insert a batch of revisions (unique on
    /// `(lane_id, revision)`) and advance the lane's `last_revision` cursor
    /// in the same atomic unit. Returns the number of rows actually
    /// inserted.
    async fn import_revisions(
        &self,
        lane_id: EntityId,
        revisions: Vec<NewRevision>,
        last_revision: Option<&str>,
    ) -> DbResult<u64>;
}

/// Revision works, work rows, and the dependency queries over them.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Step A of work expansion: insert a `NoWorkYet` revision work for
    /// every enabled (host, lane) × revision triple that doesn't have one.
    /// Returns the number inserted.
    async fn create_missing_revision_works(&self) -> DbResult<u64>;

    async fn revision_works_in_state(&self, state: WorkState) -> DbResult<Vec<RevisionWork>>;

    async fn revision_works_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>>;

    async fn revision_work(&self, id: EntityId) -> DbResult<RevisionWork>;

    /// Step B of work expansion: apply a batch of [`WorkUnit`]s atomically.
    async fn flush_work_batch(&self, units: Vec<WorkUnit>) -> DbResult<()>;

    async fn works_for_revision_work(&self, revision_work_id: EntityId) -> DbResult<Vec<Work>>;

    /// The executor's completion report: set the revision work's final state
    /// and completed flag.
    async fn set_revision_work_result(
        &self,
        id: EntityId,
        state: WorkState,
        completed: bool,
    ) -> DbResult<()>;

    /// Revision works of a lane blocked in `DependencyNotFulfilled`.
    async fn blocked_revision_works(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>>;

    /// Flip the given revision works and their work rows from
    /// `DependencyNotFulfilled` to `NotDone`, atomically. Rows no longer in
    /// the blocked state are left alone. Returns the number of revision
    /// works unblocked.
    async fn unblock_revision_works(&self, ids: &[EntityId]) -> DbResult<u64>;

    /// The fast-path set query: blocked revision works of the dependency's
    /// lane whose revision string has a completed, qualifying revision work
    /// on the dependency's target lane (and target host, if restricted).
    async fn dependency_satisfied_revision_works(
        &self,
        dependency: &LaneDependency,
    ) -> DbResult<Vec<EntityId>>;

    /// Whether one dependency holds for one revision string. Joins on the
    /// revision string, never the revision id — the dependent lane has its
    /// own revision row for the same commit.
    async fn is_dependency_satisfied(
        &self,
        dependency: &LaneDependency,
        revision: &str,
    ) -> DbResult<bool>;

    async fn revision(&self, revision_id: EntityId) -> DbResult<Revision>;

    /// Record an output file produced by a work step.
    async fn add_work_file(&self, work_id: EntityId, filename: &str) -> DbResult<WorkFile>;
}

/// The full storage contract the scheduler runs against.
pub trait Store: ConfigStore + RevisionStore + WorkStore {}

impl<T: ConfigStore + RevisionStore + WorkStore> Store for T {}
