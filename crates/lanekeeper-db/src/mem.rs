//! In-memory implementation of the store traits.
//!
//! Mirrors the PostgreSQL implementation's observable semantics (conditional
//! inserts, atomic multi-statement units) with mutex-guarded maps. Used by
//! scheduler tests and useful for local experiments without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use lanekeeper_core::dependency::LaneDependency;
use lanekeeper_core::lane::{Command, Host, HostLane, Lane, Revision};
use lanekeeper_core::work::{RevisionWork, Work, WorkFile};
use lanekeeper_core::{EntityId, WorkState};

use crate::store::{ConfigStore, NewDependency, NewLane, NewRevision, RevisionStore, WorkStore, WorkUnit};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    lanes: Vec<Lane>,
    hosts: Vec<Host>,
    host_lanes: Vec<HostLane>,
    commands: Vec<Command>,
    dependencies: Vec<LaneDependency>,
    revisions: Vec<Revision>,
    revision_works: Vec<RevisionWork>,
    works: Vec<Work>,
    work_files: Vec<WorkFile>,
}

impl Inner {
    fn revision_by_id(&self, id: EntityId) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.id == id)
    }

    fn dependency_holds(&self, dependency: &LaneDependency, revision: &str) -> bool {
        self.revision_works.iter().any(|rw| {
            rw.lane_id == dependency.dependent_lane_id
                && dependency
                    .condition
                    .qualifying_states()
                    .contains(&rw.state)
                && dependency
                    .dependent_host_id
                    .is_none_or(|host_id| rw.host_id == host_id)
                && self
                    .revision_by_id(rw.revision_id)
                    .is_some_and(|r| r.revision == revision)
                && dependency.filename.as_ref().is_none_or(|filename| {
                    self.works
                        .iter()
                        .filter(|w| w.revision_work_id == rw.id)
                        .any(|w| {
                            self.work_files
                                .iter()
                                .any(|f| f.work_id == w.id && &f.filename == filename)
                        })
                })
        })
    }
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConfigStore for MemStore {
    async fn lanes(&self) -> DbResult<Vec<Lane>> {
        Ok(self.lock().lanes.clone())
    }

    async fn hosts(&self) -> DbResult<Vec<Host>> {
        Ok(self.lock().hosts.clone())
    }

    async fn host_lanes(&self) -> DbResult<Vec<HostLane>> {
        Ok(self.lock().host_lanes.clone())
    }

    async fn commands(&self) -> DbResult<Vec<Command>> {
        Ok(self.lock().commands.clone())
    }

    async fn dependencies(&self) -> DbResult<Vec<LaneDependency>> {
        Ok(self.lock().dependencies.clone())
    }

    async fn create_lane(&self, lane: NewLane) -> DbResult<Lane> {
        let lane = Lane {
            id: EntityId::new(),
            name: lane.name,
            repository: lane.repository,
            min_revision: lane.min_revision,
            max_revision: lane.max_revision,
            source_control: lane.source_control,
            parent_lane_id: lane.parent_lane_id,
            enabled: lane.enabled,
            last_revision: String::new(),
            commit_filter: lane.commit_filter,
            traverse_merge: lane.traverse_merge,
        };
        self.lock().lanes.push(lane.clone());
        Ok(lane)
    }

    async fn create_host(&self, name: &str) -> DbResult<Host> {
        let host = Host {
            id: EntityId::new(),
            name: name.to_string(),
        };
        self.lock().hosts.push(host.clone());
        Ok(host)
    }

    async fn create_host_lane(
        &self,
        host_id: EntityId,
        lane_id: EntityId,
        enabled: bool,
    ) -> DbResult<HostLane> {
        let host_lane = HostLane {
            id: EntityId::new(),
            host_id,
            lane_id,
            enabled,
        };
        self.lock().host_lanes.push(host_lane.clone());
        Ok(host_lane)
    }

    async fn create_command(
        &self,
        lane_id: EntityId,
        name: &str,
        sequence: i32,
    ) -> DbResult<Command> {
        let command = Command {
            id: EntityId::new(),
            lane_id,
            name: name.to_string(),
            sequence,
        };
        self.lock().commands.push(command.clone());
        Ok(command)
    }

    async fn create_dependency(&self, dependency: NewDependency) -> DbResult<LaneDependency> {
        let dependency = LaneDependency {
            id: EntityId::new(),
            lane_id: dependency.lane_id,
            dependent_lane_id: dependency.dependent_lane_id,
            dependent_host_id: dependency.dependent_host_id,
            condition: dependency.condition,
            filename: dependency.filename,
        };
        self.lock().dependencies.push(dependency.clone());
        Ok(dependency)
    }
}

#[async_trait]
impl RevisionStore for MemStore {
    async fn revision_hashes(&self, lane_id: EntityId) -> DbResult<Vec<String>> {
        Ok(self
            .lock()
            .revisions
            .iter()
            .filter(|r| r.lane_id == lane_id)
            .map(|r| r.revision.clone())
            .collect())
    }

    async fn revisions_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<Revision>> {
        let mut revisions: Vec<Revision> = self
            .lock()
            .revisions
            .iter()
            .filter(|r| r.lane_id == lane_id)
            .cloned()
            .collect();
        revisions.sort_by_key(|r| r.date);
        Ok(revisions)
    }

    async fn import_revisions(
        &self,
        lane_id: EntityId,
        revisions: Vec<NewRevision>,
        last_revision: Option<&str>,
    ) -> DbResult<u64> {
        let mut inner = self.lock();
        let mut inserted = 0u64;

        for rev in revisions {
            let exists = inner
                .revisions
                .iter()
                .any(|r| r.lane_id == lane_id && r.revision == rev.revision);
            if exists {
                continue;
            }
            inner.revisions.push(Revision {
                id: EntityId::new(),
                lane_id,
                revision: rev.revision,
                author: rev.author,
                date: rev.date,
                log: rev.log,
            });
            inserted += 1;
        }

        if let Some(cursor) = last_revision {
            if let Some(lane) = inner.lanes.iter_mut().find(|l| l.id == lane_id) {
                lane.last_revision = cursor.to_string();
            }
        }

        Ok(inserted)
    }
}

#[async_trait]
impl WorkStore for MemStore {
    async fn create_missing_revision_works(&self) -> DbResult<u64> {
        let mut inner = self.lock();
        let mut created = 0u64;

        let triples: Vec<(EntityId, EntityId, EntityId)> = inner
            .host_lanes
            .iter()
            .filter(|hl| hl.enabled)
            .flat_map(|hl| {
                inner
                    .revisions
                    .iter()
                    .filter(|r| r.lane_id == hl.lane_id)
                    .map(|r| (hl.lane_id, hl.host_id, r.id))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (lane_id, host_id, revision_id) in triples {
            let exists = inner.revision_works.iter().any(|rw| {
                rw.lane_id == lane_id && rw.host_id == host_id && rw.revision_id == revision_id
            });
            if exists {
                continue;
            }
            inner.revision_works.push(RevisionWork {
                id: EntityId::new(),
                lane_id,
                host_id,
                revision_id,
                state: WorkState::NoWorkYet,
                completed: false,
            });
            created += 1;
        }

        Ok(created)
    }

    async fn revision_works_in_state(&self, state: WorkState) -> DbResult<Vec<RevisionWork>> {
        Ok(self
            .lock()
            .revision_works
            .iter()
            .filter(|rw| rw.state == state)
            .cloned()
            .collect())
    }

    async fn revision_works_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>> {
        Ok(self
            .lock()
            .revision_works
            .iter()
            .filter(|rw| rw.lane_id == lane_id)
            .cloned()
            .collect())
    }

    async fn revision_work(&self, id: EntityId) -> DbResult<RevisionWork> {
        self.lock()
            .revision_works
            .iter()
            .find(|rw| rw.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("revision work {}", id)))
    }

    async fn flush_work_batch(&self, units: Vec<WorkUnit>) -> DbResult<()> {
        let mut inner = self.lock();
        for unit in units {
            for command_id in &unit.command_ids {
                inner.works.push(Work {
                    id: EntityId::new(),
                    revision_work_id: unit.revision_work_id,
                    command_id: *command_id,
                    state: unit.state,
                });
            }
            if let Some(rw) = inner
                .revision_works
                .iter_mut()
                .find(|rw| rw.id == unit.revision_work_id && rw.state == WorkState::NoWorkYet)
            {
                rw.state = unit.state;
            }
        }
        Ok(())
    }

    async fn works_for_revision_work(&self, revision_work_id: EntityId) -> DbResult<Vec<Work>> {
        Ok(self
            .lock()
            .works
            .iter()
            .filter(|w| w.revision_work_id == revision_work_id)
            .cloned()
            .collect())
    }

    async fn set_revision_work_result(
        &self,
        id: EntityId,
        state: WorkState,
        completed: bool,
    ) -> DbResult<()> {
        let mut inner = self.lock();
        if let Some(rw) = inner.revision_works.iter_mut().find(|rw| rw.id == id) {
            rw.state = state;
            rw.completed = completed;
        }
        Ok(())
    }

    async fn blocked_revision_works(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>> {
        Ok(self
            .lock()
            .revision_works
            .iter()
            .filter(|rw| rw.lane_id == lane_id && rw.state == WorkState::DependencyNotFulfilled)
            .cloned()
            .collect())
    }

    async fn unblock_revision_works(&self, ids: &[EntityId]) -> DbResult<u64> {
        let mut inner = self.lock();
        let mut unblocked = 0u64;

        for work in inner
            .works
            .iter_mut()
            .filter(|w| ids.contains(&w.revision_work_id))
        {
            if work.state == WorkState::DependencyNotFulfilled {
                work.state = WorkState::NotDone;
            }
        }
        for rw in inner
            .revision_works
            .iter_mut()
            .filter(|rw| ids.contains(&rw.id))
        {
            if rw.state == WorkState::DependencyNotFulfilled {
                rw.state = WorkState::NotDone;
                unblocked += 1;
            }
        }

        Ok(unblocked)
    }

    async fn dependency_satisfied_revision_works(
        &self,
        dependency: &LaneDependency,
    ) -> DbResult<Vec<EntityId>> {
        let inner = self.lock();
        let mut satisfied = Vec::new();

        for rw in inner
            .revision_works
            .iter()
            .filter(|rw| {
                rw.lane_id == dependency.lane_id
                    && rw.state == WorkState::DependencyNotFulfilled
            })
        {
            let Some(revision) = inner.revision_by_id(rw.revision_id) else {
                continue;
            };
            let holds = inner.revision_works.iter().any(|sub| {
                sub.completed
                    && sub.lane_id == dependency.dependent_lane_id
                    && dependency
                        .condition
                        .qualifying_states()
                        .contains(&sub.state)
                    && dependency
                        .dependent_host_id
                        .is_none_or(|host_id| sub.host_id == host_id)
                    && inner
                        .revision_by_id(sub.revision_id)
                        .is_some_and(|r| r.revision == revision.revision)
            });
            if holds {
                satisfied.push(rw.id);
            }
        }

        Ok(satisfied)
    }

    async fn is_dependency_satisfied(
        &self,
        dependency: &LaneDependency,
        revision: &str,
    ) -> DbResult<bool> {
        Ok(self.lock().dependency_holds(dependency, revision))
    }

    async fn revision(&self, revision_id: EntityId) -> DbResult<Revision> {
        self.lock()
            .revision_by_id(revision_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("revision {}", revision_id)))
    }

    async fn add_work_file(&self, work_id: EntityId, filename: &str) -> DbResult<WorkFile> {
        let file = WorkFile {
            id: EntityId::new(),
            work_id,
            filename: filename.to_string(),
        };
        self.lock().work_files.push(file.clone());
        Ok(file)
    }
}
