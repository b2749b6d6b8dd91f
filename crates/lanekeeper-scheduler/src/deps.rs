//! Dependency resolution: transitions blocked work into runnable state once
//! the declared lane dependencies are satisfied.
//!
//! Matching is always on the revision *string*, never the revision id: the
//! dependent lane has its own revision row for the same commit.

use std::collections::HashMap;

use lanekeeper_core::EntityId;
use lanekeeper_core::dependency::LaneDependency;
use lanekeeper_core::progress::ProgressLog;
use lanekeeper_db::Store;

use crate::SchedulerResult;

/// Proactive resolution pass over all dependency declarations; runs every
/// scheduling cycle.
pub async fn resolve_all(store: &dyn Store, log: &dyn ProgressLog) -> SchedulerResult<()> {
    let dependencies = store.dependencies().await?;
    if dependencies.is_empty() {
        return Ok(());
    }

    log.log(&format!(
        "CheckDependencies: checking {} dependencies",
        dependencies.len()
    ));

    let by_lane = group_by_lane(&dependencies);

    // The set-based fast path handles the common shape: one dependency per
    // lane, success / success-or-issues conditions only.
    let fast = by_lane.values().all(|deps| {
        deps.len() == 1 && deps[0].condition.supports_fast_path()
    });

    if !fast {
        log.log(
            "CheckDependencies: multiple dependencies per lane or file conditions present, \
             using per-row evaluation",
        );
        return resolve_slow(store, &by_lane, log).await;
    }

    for dependency in &dependencies {
        let satisfied = store.dependency_satisfied_revision_works(dependency).await?;
        if satisfied.is_empty() {
            continue;
        }
        let unblocked = store.unblock_revision_works(&satisfied).await?;
        log.log(&format!(
            "CheckDependencies: dependency {} unblocked {} revision works",
            dependency.id, unblocked
        ));
    }

    Ok(())
}

/// Per-row evaluation for lanes with several dependencies or conditions the
/// set query cannot express. ALL of a lane's dependencies must hold for a
/// revision before its work runs.
async fn resolve_slow(
    store: &dyn Store,
    by_lane: &HashMap<EntityId, Vec<&LaneDependency>>,
    log: &dyn ProgressLog,
) -> SchedulerResult<()> {
    for (lane_id, deps) in by_lane {
        let blocked = store.blocked_revision_works(*lane_id).await?;
        if blocked.is_empty() {
            continue;
        }

        let mut satisfied = Vec::new();
        for revision_work in &blocked {
            let revision = store.revision(revision_work.revision_id).await?.revision;
            if all_hold(store, deps, &revision).await? {
                satisfied.push(revision_work.id);
            }
        }

        if !satisfied.is_empty() {
            let unblocked = store.unblock_revision_works(&satisfied).await?;
            log.log(&format!(
                "CheckDependencies: lane {} unblocked {} of {} blocked revision works",
                lane_id,
                unblocked,
                blocked.len()
            ));
        }
    }
    Ok(())
}

async fn all_hold(
    store: &dyn Store,
    deps: &[&LaneDependency],
    revision: &str,
) -> SchedulerResult<bool> {
    for dep in deps {
        if !store.is_dependency_satisfied(dep, revision).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reactive resolution, invoked right after a revision work completes so
/// dependents unblock without waiting for the next cycle.
pub async fn report_completed_revision_work(
    store: &dyn Store,
    revision_work_id: EntityId,
    log: &dyn ProgressLog,
) -> SchedulerResult<()> {
    let revision_work = store.revision_work(revision_work_id).await?;

    if !revision_work.state.is_successish() {
        // No dependency condition can be satisfied by this outcome.
        return Ok(());
    }

    let dependencies = store.dependencies().await?;
    let by_lane = group_by_lane(&dependencies);
    let revision = store.revision(revision_work.revision_id).await?.revision;

    // Lanes that declare a dependency on the lane that just completed.
    for (lane_id, deps) in &by_lane {
        if !deps
            .iter()
            .any(|dep| dep.dependent_lane_id == revision_work.lane_id)
        {
            continue;
        }

        let blocked = store.blocked_revision_works(*lane_id).await?;
        let mut satisfied = Vec::new();
        for candidate in &blocked {
            if store.revision(candidate.revision_id).await?.revision != revision {
                continue;
            }
            if all_hold(store, deps, &revision).await? {
                satisfied.push(candidate.id);
            }
        }

        if !satisfied.is_empty() {
            let unblocked = store.unblock_revision_works(&satisfied).await?;
            log.log(&format!(
                "ReportCompletedRevisionWork: unblocked {} revision works in lane {} for revision '{}'",
                unblocked, lane_id, revision
            ));
        }
    }

    Ok(())
}

fn group_by_lane(dependencies: &[LaneDependency]) -> HashMap<EntityId, Vec<&LaneDependency>> {
    let mut by_lane: HashMap<EntityId, Vec<&LaneDependency>> = HashMap::new();
    for dep in dependencies {
        by_lane.entry(dep.lane_id).or_default().push(dep);
    }
    by_lane
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lanekeeper_core::lane::Host;
    use lanekeeper_core::progress::MemoryLog;
    use lanekeeper_core::{DependencyCondition, WorkState};
    use lanekeeper_db::{
        ConfigStore, MemStore, NewDependency, NewLane, NewRevision, RevisionStore, WorkStore,
    };
    use lanekeeper_core::lane::Lane;

    async fn import(store: &MemStore, lane_id: EntityId, hashes: &[&str]) {
        let revisions = hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| NewRevision {
                revision: hash.to_string(),
                author: "dev".to_string(),
                date: Utc.timestamp_opt(1000 + i as i64, 0).unwrap(),
                log: String::new(),
            })
            .collect();
        store.import_revisions(lane_id, revisions, None).await.unwrap();
    }

    struct Fixture {
        store: MemStore,
        upstream: Lane,
        gated: Lane,
        host: Host,
    }

    /// Lane `gated` depends on lane `upstream`; both enabled on one host,
    /// revision `c1` imported and expanded on both.
    async fn fixture(condition: DependencyCondition, filename: Option<&str>) -> Fixture {
        let store = MemStore::new();
        let upstream = store
            .create_lane(NewLane {
                name: "a".to_string(),
                ..NewLane::default()
            })
            .await
            .unwrap();
        let gated = store
            .create_lane(NewLane {
                name: "b".to_string(),
                ..NewLane::default()
            })
            .await
            .unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, upstream.id, true).await.unwrap();
        store.create_host_lane(host.id, gated.id, true).await.unwrap();
        store.create_command(upstream.id, "build", 0).await.unwrap();
        store.create_command(gated.id, "build", 0).await.unwrap();
        store
            .create_dependency(NewDependency {
                lane_id: gated.id,
                dependent_lane_id: upstream.id,
                dependent_host_id: None,
                condition,
                filename: filename.map(String::from),
            })
            .await
            .unwrap();

        import(&store, upstream.id, &["c1"]).await;
        import(&store, gated.id, &["c1"]).await;
        crate::expand::expand(&store, &MemoryLog::new()).await.unwrap();

        Fixture {
            store,
            upstream,
            gated,
            host,
        }
    }

    async fn single_revision_work(store: &MemStore, lane_id: EntityId) -> EntityId {
        let rws = store.revision_works_for_lane(lane_id).await.unwrap();
        assert_eq!(rws.len(), 1);
        rws[0].id
    }

    #[tokio::test]
    async fn blocked_work_stays_blocked_until_upstream_succeeds() {
        let f = fixture(DependencyCondition::Success, None).await;

        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::DependencyNotFulfilled
        );

        // Upstream succeeds for the same revision string.
        let upstream_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(upstream_rw, WorkState::Success, true)
            .await
            .unwrap();

        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        let unblocked = f.store.revision_work(gated_rw).await.unwrap();
        assert_eq!(unblocked.state, WorkState::NotDone);
        let works = f.store.works_for_revision_work(gated_rw).await.unwrap();
        assert!(works.iter().all(|w| w.state == WorkState::NotDone));
    }

    #[tokio::test]
    async fn issues_only_satisfies_issues_or_success() {
        let f = fixture(DependencyCondition::Success, None).await;
        let upstream_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(upstream_rw, WorkState::Issues, true)
            .await
            .unwrap();

        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::DependencyNotFulfilled
        );

        let g = fixture(DependencyCondition::IssuesOrSuccess, None).await;
        let upstream_rw = single_revision_work(&g.store, g.upstream.id).await;
        g.store
            .set_revision_work_result(upstream_rw, WorkState::Issues, true)
            .await
            .unwrap();

        resolve_all(&g.store, &MemoryLog::new()).await.unwrap();
        let gated_rw = single_revision_work(&g.store, g.gated.id).await;
        assert_eq!(
            g.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::NotDone
        );
    }

    #[tokio::test]
    async fn host_restricted_dependency_ignores_other_hosts() {
        let f = fixture(DependencyCondition::Success, None).await;
        // Restrict to a host that never built the upstream lane.
        let other = f.store.create_host("builder2").await.unwrap();
        let store = &f.store;
        let deps = store.dependencies().await.unwrap();
        assert_eq!(deps.len(), 1);

        let restricted = LaneDependency {
            dependent_host_id: Some(other.id),
            ..deps[0].clone()
        };

        let upstream_rw = single_revision_work(store, f.upstream.id).await;
        store
            .set_revision_work_result(upstream_rw, WorkState::Success, true)
            .await
            .unwrap();

        let matches = store
            .dependency_satisfied_revision_works(&restricted)
            .await
            .unwrap();
        assert!(matches.is_empty());

        // Matching host qualifies.
        let on_host = LaneDependency {
            dependent_host_id: Some(f.host.id),
            ..deps[0].clone()
        };
        let matches = store
            .dependency_satisfied_revision_works(&on_host)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn with_file_condition_requires_the_named_output() {
        let f = fixture(DependencyCondition::SuccessWithFile, Some("bundle.zip")).await;
        let upstream_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(upstream_rw, WorkState::Success, true)
            .await
            .unwrap();

        // SuccessWithFile routes to the per-row path; without the file the
        // work stays blocked.
        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::DependencyNotFulfilled
        );

        let works = f.store.works_for_revision_work(upstream_rw).await.unwrap();
        f.store
            .add_work_file(works[0].id, "bundle.zip")
            .await
            .unwrap();

        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::NotDone
        );
    }

    #[tokio::test]
    async fn all_dependencies_must_hold() {
        let f = fixture(DependencyCondition::Success, None).await;
        // A second upstream lane the gated lane also depends on.
        let second = f
            .store
            .create_lane(NewLane {
                name: "c".to_string(),
                ..NewLane::default()
            })
            .await
            .unwrap();
        f.store
            .create_host_lane(f.host.id, second.id, true)
            .await
            .unwrap();
        f.store.create_command(second.id, "build", 0).await.unwrap();
        f.store
            .create_dependency(NewDependency {
                lane_id: f.gated.id,
                dependent_lane_id: second.id,
                dependent_host_id: None,
                condition: DependencyCondition::Success,
                filename: None,
            })
            .await
            .unwrap();
        import(&f.store, second.id, &["c1"]).await;
        crate::expand::expand(&f.store, &MemoryLog::new()).await.unwrap();

        let first_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(first_rw, WorkState::Success, true)
            .await
            .unwrap();

        // Only one of two dependencies satisfied: still blocked.
        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::DependencyNotFulfilled
        );

        let second_rw = single_revision_work(&f.store, second.id).await;
        f.store
            .set_revision_work_result(second_rw, WorkState::Success, true)
            .await
            .unwrap();

        resolve_all(&f.store, &MemoryLog::new()).await.unwrap();
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::NotDone
        );
    }

    #[tokio::test]
    async fn completion_report_unblocks_dependents_immediately() {
        let f = fixture(DependencyCondition::Success, None).await;
        let upstream_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(upstream_rw, WorkState::Success, true)
            .await
            .unwrap();

        report_completed_revision_work(&f.store, upstream_rw, &MemoryLog::new())
            .await
            .unwrap();

        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::NotDone
        );
    }

    #[tokio::test]
    async fn failed_completion_unblocks_nothing() {
        let f = fixture(DependencyCondition::Success, None).await;
        let upstream_rw = single_revision_work(&f.store, f.upstream.id).await;
        f.store
            .set_revision_work_result(upstream_rw, WorkState::Failed, true)
            .await
            .unwrap();

        report_completed_revision_work(&f.store, upstream_rw, &MemoryLog::new())
            .await
            .unwrap();

        let gated_rw = single_revision_work(&f.store, f.gated.id).await;
        assert_eq!(
            f.store.revision_work(gated_rw).await.unwrap().state,
            WorkState::DependencyNotFulfilled
        );
    }
}
