//! The scheduling queue: coalesces duplicate update requests per repository
//! and hands out work with per-repository mutual exclusion.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};

use lanekeeper_core::EntityId;
use lanekeeper_core::progress::{AggregateLog, ProgressLog, TracingLog};

#[derive(Debug, Clone, Default)]
struct UpdateParams {
    full_update: bool,
    /// `None` means all lanes.
    lane_filter: Option<BTreeSet<EntityId>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UpdateStamps {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Snapshot of a queued or in-flight update, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSnapshot {
    pub repository: String,
    pub full_update: bool,
    pub lane_filter: Option<Vec<EntityId>>,
    #[serde(flatten)]
    pub stamps: UpdateStamps,
}

/// A request to refresh one repository's revisions and derived work.
///
/// Multiple callers requesting the same repository before it starts are
/// merged into one update; all of them wait on the same completion signal.
pub struct ScheduledUpdate {
    repository: String,
    params: Mutex<UpdateParams>,
    stamps: Mutex<UpdateStamps>,
    log: AggregateLog,
    completed_tx: watch::Sender<bool>,
    completed_rx: watch::Receiver<bool>,
}

impl ScheduledUpdate {
    pub fn new(
        repository: impl Into<String>,
        full_update: bool,
        lane_filter: Option<Vec<EntityId>>,
    ) -> Arc<Self> {
        let (completed_tx, completed_rx) = watch::channel(false);
        Arc::new(Self {
            repository: repository.into(),
            params: Mutex::new(UpdateParams {
                full_update,
                lane_filter: lane_filter.map(|ids| ids.into_iter().collect()),
            }),
            stamps: Mutex::new(UpdateStamps::default()),
            log: AggregateLog::with_sink(Arc::new(TracingLog)),
            completed_tx,
            completed_rx,
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn full_update(&self) -> bool {
        self.lock_params().full_update
    }

    /// The lane restriction, `None` meaning all lanes.
    pub fn lane_filter(&self) -> Option<Vec<EntityId>> {
        self.lock_params()
            .lane_filter
            .as_ref()
            .map(|ids| ids.iter().copied().collect())
    }

    pub fn log(&self) -> &AggregateLog {
        &self.log
    }

    /// Attach another sink (e.g. an HTTP response stream) to this update's
    /// log. Late attachment is fine; only subsequent lines are seen.
    pub fn add_log_sink(&self, sink: Arc<dyn ProgressLog>) {
        self.log.add_sink(sink);
    }

    pub fn stamps(&self) -> UpdateStamps {
        *self.stamps.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> UpdateSnapshot {
        UpdateSnapshot {
            repository: self.repository.clone(),
            full_update: self.full_update(),
            lane_filter: self.lane_filter(),
            stamps: self.stamps(),
        }
    }

    /// Block until the update has been processed. Does not consume the
    /// signal; any number of callers may wait.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.completed_rx.clone();
        // Error means the sender is gone, which only happens on teardown.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Merge another request for the same repository into this one: OR the
    /// full-update flag, union the lane filters. A `None` filter means all
    /// lanes and dominates any restricted list.
    fn merge_with(&self, other: &ScheduledUpdate) {
        let other_params = other.lock_params().clone();
        let mut params = self.lock_params();

        params.full_update |= other_params.full_update;
        params.lane_filter = match (params.lane_filter.take(), other_params.lane_filter) {
            (Some(mut mine), Some(theirs)) => {
                mine.extend(theirs);
                Some(mine)
            }
            _ => None,
        };
    }

    fn mark_completed(&self) {
        let _ = self.completed_tx.send(true);
    }

    fn lock_params(&self) -> MutexGuard<'_, UpdateParams> {
        self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_stamp(&self, set: impl FnOnce(&mut UpdateStamps)) {
        set(&mut self.stamps.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

#[derive(Default)]
struct QueueInner {
    waiting: HashMap<String, Arc<ScheduledUpdate>>,
    working: HashMap<String, Arc<ScheduledUpdate>>,
}

/// Holds updates waiting to run and updates being run, keyed by repository
/// URL. A repository appears in at most one of the two maps at a time, so a
/// mirror directory is never touched by two concurrent updates.
#[derive(Default)]
pub struct SchedulerQueue {
    inner: Mutex<QueueInner>,
    work_available: Notify,
}

impl SchedulerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an update. If one for the same repository is already waiting, the
    /// request is merged into it instead. Returns the entry that will
    /// actually run, which is what callers must wait on.
    pub fn enqueue(&self, update: Arc<ScheduledUpdate>) -> Arc<ScheduledUpdate> {
        let mut inner = self.lock();

        if let Some(existing) = inner.waiting.get(update.repository()) {
            existing.merge_with(&update);
            return existing.clone();
        }

        update.set_stamp(|s| s.scheduled_at = Some(Utc::now()));
        inner
            .waiting
            .insert(update.repository().to_string(), update.clone());
        drop(inner);

        self.work_available.notify_one();
        update
    }

    /// Wait for a waiting update whose repository is not currently being
    /// worked on, and move it to `working`. Never hands the same repository
    /// to two callers at once.
    pub async fn fetch_work(&self) -> Arc<ScheduledUpdate> {
        loop {
            // Register for wakeups before checking, so an enqueue between
            // the check and the await is not lost.
            let notified = self.work_available.notified();

            if let Some(update) = self.try_fetch() {
                return update;
            }

            notified.await;
        }
    }

    fn try_fetch(&self) -> Option<Arc<ScheduledUpdate>> {
        let mut inner = self.lock();
        let key = inner
            .waiting
            .keys()
            .find(|key| !inner.working.contains_key(*key))
            .cloned()?;

        let update = inner.waiting.remove(&key)?;
        update.set_stamp(|s| s.started_at = Some(Utc::now()));
        inner.working.insert(key, update.clone());
        Some(update)
    }

    /// Mark an update as processed: release waiters and re-check the queue,
    /// since a request for the same repository may have queued meanwhile.
    pub fn complete_work(&self, update: &ScheduledUpdate) {
        {
            let mut inner = self.lock();
            inner.working.remove(update.repository());
            update.set_stamp(|s| s.ended_at = Some(Utc::now()));
        }
        update.mark_completed();
        self.work_available.notify_one();
    }

    pub fn waiting(&self) -> Vec<Arc<ScheduledUpdate>> {
        self.lock().waiting.values().cloned().collect()
    }

    pub fn working(&self) -> Vec<Arc<ScheduledUpdate>> {
        self.lock().working.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|_| EntityId::new()).collect()
    }

    #[tokio::test]
    async fn enqueue_coalesces_same_repository() {
        let queue = SchedulerQueue::new();
        let lanes = ids(2);

        let first = queue.enqueue(ScheduledUpdate::new(
            "git://r",
            false,
            Some(vec![lanes[0]]),
        ));
        let second = queue.enqueue(ScheduledUpdate::new("git://r", true, Some(vec![lanes[1]])));

        // Merged into the first entry.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(queue.waiting().len(), 1);

        let fetched = queue.fetch_work().await;
        assert!(fetched.full_update());
        let filter = fetched.lane_filter().unwrap();
        assert_eq!(filter.len(), 2);
        assert!(filter.contains(&lanes[0]) && filter.contains(&lanes[1]));
        assert!(queue.waiting().is_empty());
        assert_eq!(queue.working().len(), 1);
    }

    #[tokio::test]
    async fn unrestricted_filter_dominates_merge() {
        let queue = SchedulerQueue::new();
        let lane = EntityId::new();

        let entry = queue.enqueue(ScheduledUpdate::new("git://r", false, Some(vec![lane])));
        queue.enqueue(ScheduledUpdate::new("git://r", false, None));
        assert_eq!(entry.lane_filter(), None);

        // Same dominance the other way around.
        let queue = SchedulerQueue::new();
        let entry = queue.enqueue(ScheduledUpdate::new("git://r", false, None));
        queue.enqueue(ScheduledUpdate::new("git://r", false, Some(vec![lane])));
        assert_eq!(entry.lane_filter(), None);
    }

    #[tokio::test]
    async fn same_repository_is_never_handed_out_twice() {
        let queue = Arc::new(SchedulerQueue::new());

        queue.enqueue(ScheduledUpdate::new("git://r", false, None));
        let in_flight = queue.fetch_work().await;

        // Re-enqueued while working: goes to waiting, but is not fetchable.
        queue.enqueue(ScheduledUpdate::new("git://r", false, None));
        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.fetch_work().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Completion makes the queued request eligible.
        queue.complete_work(&in_flight);
        let next = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.repository(), "git://r");
    }

    #[tokio::test]
    async fn waiters_are_released_on_completion() {
        let queue = Arc::new(SchedulerQueue::new());
        let entry = queue.enqueue(ScheduledUpdate::new("git://r", false, None));

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.wait_for_completion().await })
        };

        let update = queue.fetch_work().await;
        queue.complete_work(&update);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(update.stamps().ended_at.is_some());
    }
}
