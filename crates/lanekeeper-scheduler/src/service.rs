//! The scheduler service: owns the queue, the dispatch loop, and the
//! per-repository update pipeline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use lanekeeper_core::EntityId;
use lanekeeper_core::lane::Lane;
use lanekeeper_core::progress::ProgressLog;
use lanekeeper_db::Store;
use lanekeeper_vcs::VcsDriver;

use crate::lock::SchedulerLock;
use crate::notify::Notifier;
use crate::queue::{ScheduledUpdate, SchedulerQueue};
use crate::{SchedulerConfig, SchedulerResult, deps, expand, import};

/// One explicitly constructed scheduler instance: queue, dispatcher handle,
/// worker semaphore. Hosts (HTTP layer, binaries) share it by `Arc`.
pub struct SchedulerService {
    queue: SchedulerQueue,
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsDriver>,
    notifier: Notifier,
    lock: Arc<dyn SchedulerLock>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn Store>,
        vcs: Arc<dyn VcsDriver>,
        lock: Arc<dyn SchedulerLock>,
        notifier: Notifier,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_updates.max(1)));
        Arc::new(Self {
            queue: SchedulerQueue::new(),
            store,
            vcs,
            notifier,
            lock,
            config,
            workers,
        })
    }

    pub fn queue(&self) -> &SchedulerQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Spawn the background dispatch loop (and the poll timer, if
    /// configured). The returned handle lives as long as the loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        if let Some(interval) = self.config.poll_interval {
            let service = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(err) = service.enqueue_all(false, None).await {
                        warn!(error = %err, "periodic scheduling pass failed to enqueue");
                    }
                }
            });
        }

        let service = self.clone();
        tokio::spawn(async move { service.dispatch_loop().await })
    }

    /// Queue an update for one repository. If one is already waiting, the
    /// request is merged into it. The returned entry is what callers wait
    /// on; an extra log sink (e.g. an HTTP stream) can be attached to it.
    pub fn enqueue(
        &self,
        repository: &str,
        full_update: bool,
        lane_filter: Option<Vec<EntityId>>,
    ) -> Arc<ScheduledUpdate> {
        self.queue
            .enqueue(ScheduledUpdate::new(repository, full_update, lane_filter))
    }

    /// Queue updates for every distinct repository referenced by the
    /// schedulable lanes (optionally restricted to a lane subset).
    pub async fn enqueue_all(
        &self,
        full_update: bool,
        lane_filter: Option<Vec<EntityId>>,
    ) -> SchedulerResult<Vec<Arc<ScheduledUpdate>>> {
        let lanes = self.schedulable_lanes(lane_filter.as_deref()).await?;

        let mut repositories = Vec::new();
        let mut seen = HashSet::new();
        for lane in &lanes {
            for repository in lane.repositories() {
                if seen.insert(repository.url.clone()) {
                    repositories.push(repository.url);
                }
            }
        }

        Ok(repositories
            .into_iter()
            .map(|repository| self.enqueue(&repository, full_update, lane_filter.clone()))
            .collect())
    }

    /// Invoked when the executor reports a completed revision work: emits
    /// the notification event, then runs reactive dependency resolution so
    /// dependents unblock without waiting for the next cycle.
    pub async fn report_completed_revision_work(
        &self,
        revision_work_id: EntityId,
    ) -> SchedulerResult<()> {
        let revision_work = self.store.revision_work(revision_work_id).await?;

        if revision_work.completed && revision_work.state.is_completed() {
            let message = self.completion_message(&revision_work).await;
            self.notifier.emit(crate::notify::NotificationEvent {
                lane_id: revision_work.lane_id,
                host_id: revision_work.host_id,
                revision_id: revision_work.revision_id,
                state: revision_work.state,
                message,
            });
        }

        deps::report_completed_revision_work(
            self.store.as_ref(),
            revision_work_id,
            &lanekeeper_core::progress::TracingLog,
        )
        .await
    }

    /// Human-readable notification text, naming the commit author when the
    /// mirror still has the commit.
    async fn completion_message(
        &self,
        revision_work: &lanekeeper_core::work::RevisionWork,
    ) -> String {
        let Ok(revision) = self.store.revision(revision_work.revision_id).await else {
            return format!(
                "revision work {} completed with state {}",
                revision_work.id, revision_work.state
            );
        };

        let mut author = revision.author.clone();
        if let Ok(lanes) = self.store.lanes().await {
            if let Some(lane) = lanes.iter().find(|lane| lane.id == revision_work.lane_id) {
                for lane_repository in lane.repositories() {
                    match self
                        .vcs
                        .commit_identity(&lane_repository.url, &revision.revision)
                        .await
                    {
                        Ok(identity) if !identity.author_email.is_empty() => {
                            author =
                                format!("{} <{}>", identity.author_name, identity.author_email);
                            break;
                        }
                        _ => continue,
                    }
                }
            }
        }

        format!(
            "commit {} by {} finished with state {}",
            revision.revision, author, revision_work.state
        )
    }

    async fn dispatch_loop(self: Arc<Self>) {
        // Only one scheduler instance across a fleet runs this loop. The
        // guard is held for the loop's entire lifetime.
        let _guard = loop {
            match self.lock.try_acquire(&self.config.lock_name) {
                Some(guard) => break guard,
                None => {
                    info!(
                        lock = %self.config.lock_name,
                        retry_secs = self.config.lock_retry.as_secs(),
                        "could not acquire scheduler lock, retrying"
                    );
                    tokio::time::sleep(self.config.lock_retry).await;
                }
            }
        };
        info!(lock = %self.config.lock_name, "scheduler lock acquired");

        loop {
            let update = self.queue.fetch_work().await;
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                // Semaphore closed; we're shutting down.
                return;
            };

            let service = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                service.run_update(&update).await;
                service.queue.complete_work(&update);
            });
        }
    }

    /// One repository's full update pipeline:
    /// fetch -> import -> expand -> dependency check.
    ///
    /// Failures are isolated to this repository and cycle; the next trigger
    /// retries. Never panics or propagates.
    pub async fn run_update(&self, update: &ScheduledUpdate) {
        let log = update.log();
        let repository = update.repository();
        let started = Instant::now();

        log.log(&format!(
            "Updating repository '{}' (full update: {})",
            repository,
            update.full_update()
        ));

        if let Err(err) = self.vcs.fetch(repository, log).await {
            log.log(&format!(
                "Could not fetch '{}', skipping this cycle: {}",
                repository, err
            ));
            return;
        }

        let lane_filter = update.lane_filter();
        let lanes = match self.schedulable_lanes(lane_filter.as_deref()).await {
            Ok(lanes) => lanes,
            Err(err) => {
                error!(error = %err, "could not load lane configuration");
                log.log(&format!("Could not load lane configuration: {}", err));
                return;
            }
        };

        for lane in &lanes {
            for lane_repository in lane.repositories() {
                if lane_repository.url != repository {
                    continue;
                }
                let result = import::import_lane_repository(
                    self.store.as_ref(),
                    self.vcs.as_ref(),
                    lane,
                    &lane_repository,
                    update.full_update(),
                    log,
                )
                .await;
                if let Err(err) = result {
                    // Storage trouble for one lane doesn't stop the others.
                    error!(lane = %lane.name, error = %err, "revision import failed");
                    log.log(&format!(
                        "There was an error while updating lane '{}': {}",
                        lane.name, err
                    ));
                }
            }
        }

        if let Err(err) = expand::expand(self.store.as_ref(), log).await {
            error!(error = %err, "work expansion failed");
            log.log(&format!("Work expansion failed: {}", err));
        }

        if let Err(err) = deps::resolve_all(self.store.as_ref(), log).await {
            error!(error = %err, "dependency check failed");
            log.log(&format!("Dependency check failed: {}", err));
        }

        log.log(&format!(
            "Update of '{}' finished in {:.1} seconds",
            repository,
            started.elapsed().as_secs_f64()
        ));
    }

    /// Enabled lanes with at least one enabled host, optionally restricted
    /// to a lane-id subset.
    async fn schedulable_lanes(
        &self,
        lane_filter: Option<&[EntityId]>,
    ) -> SchedulerResult<Vec<Lane>> {
        let lanes = self.store.lanes().await?;
        let host_lanes = self.store.host_lanes().await?;

        Ok(lanes
            .into_iter()
            .filter(|lane| lane.enabled)
            .filter(|lane| {
                host_lanes
                    .iter()
                    .any(|hl| hl.lane_id == lane.id && hl.enabled)
            })
            .filter(|lane| lane_filter.is_none_or(|ids| ids.contains(&lane.id)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLock;
    use crate::notify::LogSink;
    use crate::testkit::{ScriptedVcs, commit};
    use lanekeeper_core::progress::MemoryLog;
    use lanekeeper_core::{DependencyCondition, WorkState};
    use lanekeeper_db::{ConfigStore, MemStore, NewDependency, NewLane, RevisionStore, WorkStore};
    use std::time::Duration;

    struct Harness {
        service: Arc<SchedulerService>,
        store: Arc<MemStore>,
        vcs: Arc<ScriptedVcs>,
    }

    fn harness(vcs: ScriptedVcs) -> Harness {
        let store = Arc::new(MemStore::new());
        let vcs = Arc::new(vcs);
        let service = SchedulerService::new(
            store.clone(),
            vcs.clone(),
            Arc::new(LocalLock::new()),
            Notifier::start(Arc::new(LogSink), 1),
            SchedulerConfig::default(),
        );
        Harness {
            service,
            store,
            vcs,
        }
    }

    async fn simple_lane(store: &MemStore, name: &str, repository: &str) -> Lane {
        let lane = store
            .create_lane(NewLane {
                name: name.to_string(),
                repository: repository.to_string(),
                ..NewLane::default()
            })
            .await
            .unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, lane.id, true).await.unwrap();
        store.create_command(lane.id, "build", 0).await.unwrap();
        lane
    }

    #[tokio::test]
    async fn one_cycle_imports_expands_and_classifies() {
        let vcs = ScriptedVcs::new().with_commits(
            "git://r",
            vec![commit("c1", "1000"), commit("c2", "1001"), commit("c3", "1002")],
        );
        let h = harness(vcs);
        let lane = simple_lane(&h.store, "A", "git://r").await;

        let update = ScheduledUpdate::new("git://r", false, None);
        h.service.run_update(&update).await;

        let revisions = h.store.revisions_for_lane(lane.id).await.unwrap();
        assert_eq!(revisions.len(), 3);

        let revision_works = h.store.revision_works_for_lane(lane.id).await.unwrap();
        assert_eq!(revision_works.len(), 3);
        for rw in &revision_works {
            assert_eq!(rw.state, WorkState::NotDone);
            let works = h.store.works_for_revision_work(rw.id).await.unwrap();
            assert_eq!(works.len(), 1);
            assert!(works.iter().all(|w| w.state == WorkState::NotDone));
        }
    }

    #[tokio::test]
    async fn second_cycle_adds_nothing_new() {
        let vcs = ScriptedVcs::new().with_commits("git://r", vec![commit("c1", "1000")]);
        let h = harness(vcs);
        let lane = simple_lane(&h.store, "A", "git://r").await;

        h.service
            .run_update(&ScheduledUpdate::new("git://r", false, None))
            .await;
        h.service
            .run_update(&ScheduledUpdate::new("git://r", false, None))
            .await;

        assert_eq!(h.store.revisions_for_lane(lane.id).await.unwrap().len(), 1);
        let rws = h.store.revision_works_for_lane(lane.id).await.unwrap();
        assert_eq!(rws.len(), 1);
        assert_eq!(
            h.store.works_for_revision_work(rws[0].id).await.unwrap().len(),
            1
        );
        // The mirror is fetched exactly once per cycle.
        assert_eq!(h.vcs.fetch_count(), 2);
    }

    #[tokio::test]
    async fn dependent_lane_unblocks_after_upstream_success() {
        let vcs = ScriptedVcs::new().with_commits("git://r", vec![commit("c1", "1000")]);
        let h = harness(vcs);
        let upstream = simple_lane(&h.store, "A", "git://r").await;
        let gated = simple_lane(&h.store, "B", "git://r").await;
        h.store
            .create_dependency(NewDependency {
                lane_id: gated.id,
                dependent_lane_id: upstream.id,
                dependent_host_id: None,
                condition: DependencyCondition::Success,
                filename: None,
            })
            .await
            .unwrap();

        h.service
            .run_update(&ScheduledUpdate::new("git://r", false, None))
            .await;

        let gated_rws = h.store.revision_works_for_lane(gated.id).await.unwrap();
        assert_eq!(gated_rws[0].state, WorkState::DependencyNotFulfilled);

        // Upstream succeeds; the executor reports completion.
        let upstream_rws = h.store.revision_works_for_lane(upstream.id).await.unwrap();
        h.store
            .set_revision_work_result(upstream_rws[0].id, WorkState::Success, true)
            .await
            .unwrap();
        h.service
            .report_completed_revision_work(upstream_rws[0].id)
            .await
            .unwrap();

        let gated_rws = h.store.revision_works_for_lane(gated.id).await.unwrap();
        assert_eq!(gated_rws[0].state, WorkState::NotDone);
    }

    #[tokio::test]
    async fn fetch_failure_skips_the_cycle() {
        let vcs = ScriptedVcs::new()
            .with_fetch_failure("git://r")
            .with_commits("git://r", vec![commit("c1", "1000")]);
        let h = harness(vcs);
        let lane = simple_lane(&h.store, "A", "git://r").await;

        let update = ScheduledUpdate::new("git://r", false, None);
        let sink = Arc::new(MemoryLog::new());
        update.add_log_sink(sink.clone());
        h.service.run_update(&update).await;

        assert!(h.store.revisions_for_lane(lane.id).await.unwrap().is_empty());
        assert!(sink.contents().contains("skipping this cycle"));
    }

    #[tokio::test]
    async fn disabled_lanes_and_hosts_get_no_work() {
        let vcs = ScriptedVcs::new().with_commits("git://r", vec![commit("c1", "1000")]);
        let h = harness(vcs);

        let disabled_lane = h
            .store
            .create_lane(NewLane {
                name: "off".to_string(),
                repository: "git://r".to_string(),
                enabled: false,
                ..NewLane::default()
            })
            .await
            .unwrap();
        let host = h.store.create_host("builder1").await.unwrap();
        h.store
            .create_host_lane(host.id, disabled_lane.id, true)
            .await
            .unwrap();

        h.service
            .run_update(&ScheduledUpdate::new("git://r", false, None))
            .await;

        assert!(
            h.store
                .revisions_for_lane(disabled_lane.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn enqueue_all_deduplicates_repositories() {
        let vcs = ScriptedVcs::new();
        let h = harness(vcs);
        simple_lane(&h.store, "A", "git://shared").await;
        simple_lane(&h.store, "B", "git://shared").await;
        simple_lane(&h.store, "C", "git://other").await;

        let updates = h.service.enqueue_all(false, None).await.unwrap();

        let repositories: HashSet<String> = updates
            .iter()
            .map(|u| u.repository().to_string())
            .collect();
        assert_eq!(repositories.len(), 2);
        assert_eq!(h.service.queue().waiting().len(), 2);
    }

    #[tokio::test]
    async fn dispatcher_processes_queued_updates() {
        let vcs = ScriptedVcs::new().with_commits("git://r", vec![commit("c1", "1000")]);
        let h = harness(vcs);
        let lane = simple_lane(&h.store, "A", "git://r").await;

        let _loop_handle = h.service.start();
        let update = h.service.enqueue("git://r", false, None);

        tokio::time::timeout(Duration::from_secs(5), update.wait_for_completion())
            .await
            .unwrap();

        assert_eq!(h.store.revisions_for_lane(lane.id).await.unwrap().len(), 1);
        assert!(h.service.queue().working().is_empty());
    }
}
