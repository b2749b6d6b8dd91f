//! Revision importer: turns fetched commit entries into durable revision
//! records and advances the lane's incremental cursor.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use lanekeeper_core::filter::CommitFilter;
use lanekeeper_core::lane::{Lane, LaneRepository};
use lanekeeper_core::progress::ProgressLog;
use lanekeeper_db::{NewRevision, Store};
use lanekeeper_vcs::{LogRange, VcsDriver};

use crate::SchedulerResult;

/// Import all new commits of one (lane, repository) pair.
///
/// Returns the number of revisions inserted. A missing commit log (fetch or
/// log failure) is a skip for this cycle, not an error.
pub async fn import_lane_repository(
    store: &dyn Store,
    vcs: &dyn VcsDriver,
    lane: &Lane,
    repository: &LaneRepository,
    full_update: bool,
    log: &dyn ProgressLog,
) -> SchedulerResult<u64> {
    // An incremental update resumes from the lane's cursor; a full update
    // recomputes from the configured bounds.
    let min_revision = if !full_update && !lane.last_revision.is_empty() {
        log.log(&format!(
            "Using last revision '{}' for lane '{}'",
            lane.last_revision, lane.name
        ));
        Some(lane.last_revision.clone())
    } else {
        repository.min_revision.clone()
    };

    let range = LogRange {
        min_revision,
        max_revision: repository.max_revision.clone().unwrap_or_default(),
        first_parent: !lane.traverse_merge,
    };

    let entries = match vcs.commit_log(&repository.url, &range, log).await {
        Ok(entries) => entries,
        Err(err) => {
            log.log(&format!(
                "Didn't get a log for '{}' in lane '{}': {}",
                repository.url, lane.name, err
            ));
            return Ok(0);
        }
    };
    if entries.is_empty() {
        return Ok(0);
    }

    let known: HashSet<String> = store.revision_hashes(lane.id).await?.into_iter().collect();
    let filter = CommitFilter::parse(&lane.commit_filter);
    let mut used_dates: HashSet<DateTime<Utc>> = HashSet::new();
    let mut revisions = Vec::new();
    // The cursor advances over everything the log covered, including entries
    // that were skipped as known or filtered.
    let cursor = entries.last().map(|e| e.revision.clone());

    for entry in entries {
        if known.contains(&entry.revision) {
            continue;
        }

        if let Some(filter) = &filter {
            let files = match vcs.changed_files(&repository.url, &entry.revision).await {
                Ok(files) => files,
                Err(err) => {
                    log.log(&format!(
                        "Couldn't get files for commit '{}': {}",
                        entry.revision, err
                    ));
                    Vec::new()
                }
            };
            if filter.excludes(&files) {
                continue;
            }
        }

        let mut date = match parse_commit_date(entry.timestamp.as_deref()) {
            Some(date) => date,
            None => {
                // Sort the malformed entry first so it is easy to spot; the
                // record itself is never dropped.
                warn!(
                    revision = %entry.revision,
                    lane = %lane.name,
                    timestamp = ?entry.timestamp,
                    "could not parse commit timestamp, using sentinel date"
                );
                log.log(&format!(
                    "Could not parse timestamp '{}' for revision '{}' in lane '{}'",
                    entry.timestamp.as_deref().unwrap_or(""),
                    entry.revision,
                    lane.name
                ));
                sentinel_date()
            }
        };

        // Commits landing within the same second would otherwise get the
        // same date, making build/display order random. Bump by a
        // millisecond until unique within this batch.
        while used_dates.contains(&date) {
            date = date + Duration::milliseconds(1);
        }
        used_dates.insert(date);

        let author = match entry.author {
            Some(author) if !author.is_empty() => author,
            _ => {
                log.log(&format!(
                    "No author specified in revision '{}' of '{}'",
                    entry.revision, repository.url
                ));
                "?".to_string()
            }
        };

        revisions.push(NewRevision {
            revision: entry.revision,
            author,
            date,
            log: entry.message,
        });
    }

    let batch_size = revisions.len();
    let inserted = store
        .import_revisions(lane.id, revisions, cursor.as_deref())
        .await?;
    log.log(&format!(
        "Imported {} of {} new revisions for lane '{}' from '{}'",
        inserted, batch_size, lane.name, repository.url
    ));

    Ok(inserted)
}

fn parse_commit_date(timestamp: Option<&str>) -> Option<DateTime<Utc>> {
    timestamp?
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Far enough in the future to stand out in any revision listing.
fn sentinel_date() -> DateTime<Utc> {
    Utc::now() + Duration::days(20 * 365)
}
