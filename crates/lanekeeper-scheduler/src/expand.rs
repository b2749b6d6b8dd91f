//! Work expansion: turns imported revisions into revision works and
//! per-command work rows. Idempotent; runs every cycle.

use std::collections::{HashMap, HashSet};

use lanekeeper_core::lane::{Command, Lane};
use lanekeeper_core::progress::ProgressLog;
use lanekeeper_core::{EntityId, WorkState};
use lanekeeper_db::{Store, WorkUnit};

use crate::SchedulerResult;

/// Flush accumulated work inserts roughly this often, to bound transaction
/// size on large backlogs. Units are never split across flushes.
const BATCH_STATEMENTS: usize = 100;

/// Run both expansion steps.
///
/// Step A inserts a `NoWorkYet` revision work for every enabled
/// (host, lane) × revision triple that lacks one. Step B gives each of those
/// its work rows (one per applicable command) and classifies it as gated or
/// runnable.
pub async fn expand(store: &dyn Store, log: &dyn ProgressLog) -> SchedulerResult<()> {
    let added = store.create_missing_revision_works().await?;
    log.log(&format!("AddRevisionWork: added {} records", added));

    let pending = store.revision_works_in_state(WorkState::NoWorkYet).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let lanes = store.lanes().await?;
    let commands = store.commands().await?;
    let gated_lanes: HashSet<EntityId> = store
        .dependencies()
        .await?
        .into_iter()
        .map(|dep| dep.lane_id)
        .collect();

    log.log(&format!(
        "AddWork: got {} revision works without work",
        pending.len()
    ));

    let mut commands_per_lane: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
    let mut batch: Vec<WorkUnit> = Vec::new();
    let mut statements = 0usize;
    let mut flushed = 0usize;

    for revision_work in pending {
        let command_ids = commands_per_lane
            .entry(revision_work.lane_id)
            .or_insert_with(|| commands_for_lane(revision_work.lane_id, &lanes, &commands))
            .clone();

        let state = if gated_lanes.contains(&revision_work.lane_id) {
            WorkState::DependencyNotFulfilled
        } else {
            WorkState::NotDone
        };

        let unit = WorkUnit {
            revision_work_id: revision_work.id,
            command_ids,
            state,
        };
        statements += unit.statement_count();
        batch.push(unit);

        if statements >= BATCH_STATEMENTS {
            flushed += statements;
            store.flush_work_batch(std::mem::take(&mut batch)).await?;
            log.log(&format!("AddWork: flushed work queue, {} statements so far", flushed));
            statements = 0;
        }
    }

    if !batch.is_empty() {
        store.flush_work_batch(batch).await?;
    }

    Ok(())
}

/// The commands applicable to a lane: inherited commands first (walking up
/// the parent chain, root-most ancestor first), then the lane's own, each
/// group in sequence order.
fn commands_for_lane(lane_id: EntityId, lanes: &[Lane], commands: &[Command]) -> Vec<EntityId> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(lane_id);

    while let Some(id) = current {
        if !seen.insert(id) {
            // Parent cycle in configuration; stop rather than loop.
            break;
        }
        chain.push(id);
        current = lanes
            .iter()
            .find(|lane| lane.id == id)
            .and_then(|lane| lane.parent_lane_id);
    }
    chain.reverse();

    let mut out = Vec::new();
    for id in chain {
        let mut lane_commands: Vec<&Command> =
            commands.iter().filter(|c| c.lane_id == id).collect();
        lane_commands.sort_by_key(|c| c.sequence);
        out.extend(lane_commands.into_iter().map(|c| c.id));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lanekeeper_core::progress::MemoryLog;
    use lanekeeper_db::{ConfigStore, MemStore, NewDependency, NewLane, NewRevision, RevisionStore, WorkStore};
    use lanekeeper_core::DependencyCondition;

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
        store
            .import_revisions(lane_id, revisions, hashes.last().copied())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expansion_is_idempotent() {
        let store = MemStore::new();
        let lane = store
            .create_lane(NewLane {
                name: "a".to_string(),
                ..NewLane::default()
            })
            .await
            .unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, lane.id, true).await.unwrap();
        store.create_command(lane.id, "build", 0).await.unwrap();
        import(&store, lane.id, &["c1", "c2"]).await;

        expand(&store, &MemoryLog::new()).await.unwrap();
        let works_after_first: usize = count_works(&store, lane.id).await;
        let rws_after_first = store.revision_works_for_lane(lane.id).await.unwrap().len();

        // Second run with no new revisions adds nothing.
        expand(&store, &MemoryLog::new()).await.unwrap();
        assert_eq!(count_works(&store, lane.id).await, works_after_first);
        assert_eq!(
            store.revision_works_for_lane(lane.id).await.unwrap().len(),
            rws_after_first
        );
    }

    async fn count_works(store: &MemStore, lane_id: EntityId) -> usize {
        let mut count = 0;
        for rw in store.revision_works_for_lane(lane_id).await.unwrap() {
            count += store.works_for_revision_work(rw.id).await.unwrap().len();
        }
        count
    }

    #[tokio::test]
    async fn ungated_lanes_classify_as_not_done() {
        let store = MemStore::new();
        let lane = store.create_lane(NewLane::default()).await.unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, lane.id, true).await.unwrap();
        store.create_command(lane.id, "build", 0).await.unwrap();
        import(&store, lane.id, &["c1"]).await;

        expand(&store, &MemoryLog::new()).await.unwrap();

        let rws = store.revision_works_for_lane(lane.id).await.unwrap();
        assert_eq!(rws[0].state, WorkState::NotDone);
        let works = store.works_for_revision_work(rws[0].id).await.unwrap();
        assert_eq!(works.len(), 1);
        assert_eq!(works[0].state, WorkState::NotDone);
    }

    #[tokio::test]
    async fn dependent_lanes_classify_as_blocked() {
        let store = MemStore::new();
        let upstream = store.create_lane(NewLane::default()).await.unwrap();
        let gated = store.create_lane(NewLane::default()).await.unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, gated.id, true).await.unwrap();
        store.create_command(gated.id, "build", 0).await.unwrap();
        store
            .create_dependency(NewDependency {
                lane_id: gated.id,
                dependent_lane_id: upstream.id,
                dependent_host_id: None,
                condition: DependencyCondition::Success,
                filename: None,
            })
            .await
            .unwrap();
        import(&store, gated.id, &["c1"]).await;

        expand(&store, &MemoryLog::new()).await.unwrap();

        let rws = store.revision_works_for_lane(gated.id).await.unwrap();
        assert_eq!(rws[0].state, WorkState::DependencyNotFulfilled);
        let works = store.works_for_revision_work(rws[0].id).await.unwrap();
        assert_eq!(works[0].state, WorkState::DependencyNotFulfilled);
    }

    #[tokio::test]
    async fn commands_inherit_from_ancestors_root_first() {
        let store = MemStore::new();
        let root = store.create_lane(NewLane::default()).await.unwrap();
        let child = store
            .create_lane(NewLane {
                parent_lane_id: Some(root.id),
                ..NewLane::default()
            })
            .await
            .unwrap();
        let checkout = store.create_command(root.id, "checkout", 0).await.unwrap();
        let build = store.create_command(child.id, "build", 0).await.unwrap();
        let lanes = store.lanes().await.unwrap();
        let commands = store.commands().await.unwrap();

        let ordered = commands_for_lane(child.id, &lanes, &commands);
        assert_eq!(ordered, vec![checkout.id, build.id]);
    }

    #[tokio::test]
    async fn large_backlogs_are_flushed_in_batches() {
        let store = MemStore::new();
        let lane = store.create_lane(NewLane::default()).await.unwrap();
        let host = store.create_host("builder1").await.unwrap();
        store.create_host_lane(host.id, lane.id, true).await.unwrap();
        for i in 0..3 {
            store
                .create_command(lane.id, &format!("step{}", i), i)
                .await
                .unwrap();
        }
        let hashes: Vec<String> = (0..120).map(|i| format!("c{}", i)).collect();
        let refs: Vec<&str> = hashes.iter().map(String::as_str).collect();
        import(&store, lane.id, &refs).await;

        expand(&store, &MemoryLog::new()).await.unwrap();

        // Every revision work ended up classified with all its work rows.
        assert!(
            store
                .revision_works_in_state(WorkState::NoWorkYet)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(count_works(&store, lane.id).await, 120 * 3);
    }
}
