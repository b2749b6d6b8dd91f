//! PostgreSQL implementation of the store traits.
//!
//! Conditional inserts rely on `ON CONFLICT DO NOTHING` against the unique
//! constraints, so concurrent importers racing on the same lane cannot
//! create duplicates. Multi-statement operations run in transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use lanekeeper_core::dependency::LaneDependency;
use lanekeeper_core::lane::{Command, Host, HostLane, Lane, Revision};
use lanekeeper_core::work::{RevisionWork, Work, WorkFile};
use lanekeeper_core::{EntityId, WorkState};

use crate::store::{ConfigStore, NewDependency, NewLane, NewRevision, RevisionStore, WorkStore, WorkUnit};
use crate::{DbError, DbResult};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LaneRow {
    id: Uuid,
    name: String,
    repository: String,
    min_revision: String,
    max_revision: String,
    source_control: String,
    parent_lane_id: Option<Uuid>,
    enabled: bool,
    last_revision: String,
    commit_filter: String,
    traverse_merge: bool,
}

impl TryFrom<LaneRow> for Lane {
    type Error = DbError;

    fn try_from(row: LaneRow) -> DbResult<Lane> {
        Ok(Lane {
            id: row.id.into(),
            name: row.name,
            repository: row.repository,
            min_revision: row.min_revision,
            max_revision: row.max_revision,
            source_control: row.source_control.parse().map_err(DbError::Decode)?,
            parent_lane_id: row.parent_lane_id.map(EntityId::from),
            enabled: row.enabled,
            last_revision: row.last_revision,
            commit_filter: row.commit_filter,
            traverse_merge: row.traverse_merge,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RevisionRow {
    id: Uuid,
    lane_id: Uuid,
    revision: String,
    author: String,
    date: DateTime<Utc>,
    log: String,
}

impl From<RevisionRow> for Revision {
    fn from(row: RevisionRow) -> Revision {
        Revision {
            id: row.id.into(),
            lane_id: row.lane_id.into(),
            revision: row.revision,
            author: row.author,
            date: row.date,
            log: row.log,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RevisionWorkRow {
    id: Uuid,
    lane_id: Uuid,
    host_id: Uuid,
    revision_id: Uuid,
    state: String,
    completed: bool,
}

impl TryFrom<RevisionWorkRow> for RevisionWork {
    type Error = DbError;

    fn try_from(row: RevisionWorkRow) -> DbResult<RevisionWork> {
        Ok(RevisionWork {
            id: row.id.into(),
            lane_id: row.lane_id.into(),
            host_id: row.host_id.into(),
            revision_id: row.revision_id.into(),
            state: row.state.parse().map_err(DbError::Decode)?,
            completed: row.completed,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkRow {
    id: Uuid,
    revision_work_id: Uuid,
    command_id: Uuid,
    state: String,
}

impl TryFrom<WorkRow> for Work {
    type Error = DbError;

    fn try_from(row: WorkRow) -> DbResult<Work> {
        Ok(Work {
            id: row.id.into(),
            revision_work_id: row.revision_work_id.into(),
            command_id: row.command_id.into(),
            state: row.state.parse().map_err(DbError::Decode)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DependencyRow {
    id: Uuid,
    lane_id: Uuid,
    dependent_lane_id: Uuid,
    dependent_host_id: Option<Uuid>,
    condition: String,
    filename: Option<String>,
}

impl TryFrom<DependencyRow> for LaneDependency {
    type Error = DbError;

    fn try_from(row: DependencyRow) -> DbResult<LaneDependency> {
        Ok(LaneDependency {
            id: row.id.into(),
            lane_id: row.lane_id.into(),
            dependent_lane_id: row.dependent_lane_id.into(),
            dependent_host_id: row.dependent_host_id.map(EntityId::from),
            condition: row.condition.parse().map_err(DbError::Decode)?,
            filename: row.filename,
        })
    }
}

fn state_strings(states: &[WorkState]) -> Vec<String> {
    states.iter().map(|s| s.to_string()).collect()
}

fn uuids(ids: &[EntityId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn lanes(&self) -> DbResult<Vec<Lane>> {
        let rows = sqlx::query_as::<_, LaneRow>("SELECT * FROM lanes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Lane::try_from).collect()
    }

    async fn hosts(&self) -> DbResult<Vec<Host>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>("SELECT id, name FROM hosts ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name)| Host { id: id.into(), name })
            .collect())
    }

    async fn host_lanes(&self) -> DbResult<Vec<HostLane>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid, bool)>(
            "SELECT id, host_id, lane_id, enabled FROM host_lanes",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, host_id, lane_id, enabled)| HostLane {
                id: id.into(),
                host_id: host_id.into(),
                lane_id: lane_id.into(),
                enabled,
            })
            .collect())
    }

    async fn commands(&self) -> DbResult<Vec<Command>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, String, i32)>(
            "SELECT id, lane_id, name, sequence FROM commands ORDER BY sequence",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, lane_id, name, sequence)| Command {
                id: id.into(),
                lane_id: lane_id.into(),
                name,
                sequence,
            })
            .collect())
    }

    async fn dependencies(&self) -> DbResult<Vec<LaneDependency>> {
        let rows = sqlx::query_as::<_, DependencyRow>("SELECT * FROM lane_dependencies")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(LaneDependency::try_from).collect()
    }

    async fn create_lane(&self, lane: NewLane) -> DbResult<Lane> {
        let row = sqlx::query_as::<_, LaneRow>(
            r#"
            INSERT INTO lanes (id, name, repository, min_revision, max_revision,
                               source_control, parent_lane_id, enabled, last_revision,
                               commit_filter, traverse_merge)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '', $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&lane.name)
        .bind(&lane.repository)
        .bind(&lane.min_revision)
        .bind(&lane.max_revision)
        .bind(lane.source_control.to_string())
        .bind(lane.parent_lane_id.map(|id| *id.as_uuid()))
        .bind(lane.enabled)
        .bind(&lane.commit_filter)
        .bind(lane.traverse_merge)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn create_host(&self, name: &str) -> DbResult<Host> {
        let (id, name) = sqlx::query_as::<_, (Uuid, String)>(
            "INSERT INTO hosts (id, name) VALUES ($1, $2) RETURNING id, name",
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(Host { id: id.into(), name })
    }

    async fn create_host_lane(
        &self,
        host_id: EntityId,
        lane_id: EntityId,
        enabled: bool,
    ) -> DbResult<HostLane> {
        let (id, host_id, lane_id, enabled) = sqlx::query_as::<_, (Uuid, Uuid, Uuid, bool)>(
            r#"
            INSERT INTO host_lanes (id, host_id, lane_id, enabled)
            VALUES ($1, $2, $3, $4)
            RETURNING id, host_id, lane_id, enabled
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(host_id.as_uuid())
        .bind(lane_id.as_uuid())
        .bind(enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(HostLane {
            id: id.into(),
            host_id: host_id.into(),
            lane_id: lane_id.into(),
            enabled,
        })
    }

    async fn create_command(
        &self,
        lane_id: EntityId,
        name: &str,
        sequence: i32,
    ) -> DbResult<Command> {
        let (id, lane_id, name, sequence) = sqlx::query_as::<_, (Uuid, Uuid, String, i32)>(
            r#"
            INSERT INTO commands (id, lane_id, name, sequence)
            VALUES ($1, $2, $3, $4)
            RETURNING id, lane_id, name, sequence
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(lane_id.as_uuid())
        .bind(name)
        .bind(sequence)
        .fetch_one(&self.pool)
        .await?;
        Ok(Command {
            id: id.into(),
            lane_id: lane_id.into(),
            name,
            sequence,
        })
    }

    async fn create_dependency(&self, dependency: NewDependency) -> DbResult<LaneDependency> {
        let row = sqlx::query_as::<_, DependencyRow>(
            r#"
            INSERT INTO lane_dependencies (id, lane_id, dependent_lane_id,
                                           dependent_host_id, condition, filename)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(dependency.lane_id.as_uuid())
        .bind(dependency.dependent_lane_id.as_uuid())
        .bind(dependency.dependent_host_id.map(|id| *id.as_uuid()))
        .bind(dependency.condition.to_string())
        .bind(&dependency.filename)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }
}

#[async_trait]
impl RevisionStore for PgStore {
    async fn revision_hashes(&self, lane_id: EntityId) -> DbResult<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT revision FROM revisions WHERE lane_id = $1",
        )
        .bind(lane_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(r,)| r).collect())
    }

    async fn revisions_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<Revision>> {
        let rows = sqlx::query_as::<_, RevisionRow>(
            "SELECT * FROM revisions WHERE lane_id = $1 ORDER BY date",
        )
        .bind(lane_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Revision::from).collect())
    }

    async fn import_revisions(
        &self,
        lane_id: EntityId,
        revisions: Vec<NewRevision>,
        last_revision: Option<&str>,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for rev in &revisions {
            let result = sqlx::query(
                r#"
                INSERT INTO revisions (id, lane_id, revision, author, date, log)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (lane_id, revision) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(lane_id.as_uuid())
            .bind(&rev.revision)
            .bind(&rev.author)
            .bind(rev.date)
            .bind(&rev.log)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        if let Some(cursor) = last_revision {
            sqlx::query("UPDATE lanes SET last_revision = $1 WHERE id = $2")
                .bind(cursor)
                .bind(lane_id.as_uuid())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl WorkStore for PgStore {
    async fn create_missing_revision_works(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO revision_works (id, lane_id, host_id, revision_id, state, completed)
            SELECT gen_random_uuid(), l.id, h.id, r.id, $1, FALSE
            FROM host_lanes hl
            INNER JOIN hosts h ON hl.host_id = h.id
            INNER JOIN lanes l ON hl.lane_id = l.id
            INNER JOIN revisions r ON r.lane_id = l.id
            WHERE hl.enabled = TRUE
            ON CONFLICT (lane_id, host_id, revision_id) DO NOTHING
            "#,
        )
        .bind(WorkState::NoWorkYet.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revision_works_in_state(&self, state: WorkState) -> DbResult<Vec<RevisionWork>> {
        let rows = sqlx::query_as::<_, RevisionWorkRow>(
            "SELECT * FROM revision_works WHERE state = $1",
        )
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RevisionWork::try_from).collect()
    }

    async fn revision_works_for_lane(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>> {
        let rows = sqlx::query_as::<_, RevisionWorkRow>(
            "SELECT * FROM revision_works WHERE lane_id = $1",
        )
        .bind(lane_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RevisionWork::try_from).collect()
    }

    async fn revision_work(&self, id: EntityId) -> DbResult<RevisionWork> {
        let row = sqlx::query_as::<_, RevisionWorkRow>(
            "SELECT * FROM revision_works WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("revision work {}", id)))?;
        row.try_into()
    }

    async fn flush_work_batch(&self, units: Vec<WorkUnit>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        for unit in &units {
            for command_id in &unit.command_ids {
                sqlx::query(
                    r#"
                    INSERT INTO works (id, revision_work_id, command_id, state)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(Uuid::now_v7())
                .bind(unit.revision_work_id.as_uuid())
                .bind(command_id.as_uuid())
                .bind(unit.state.to_string())
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE revision_works SET state = $1 WHERE id = $2 AND state = $3")
                .bind(unit.state.to_string())
                .bind(unit.revision_work_id.as_uuid())
                .bind(WorkState::NoWorkYet.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn works_for_revision_work(&self, revision_work_id: EntityId) -> DbResult<Vec<Work>> {
        let rows = sqlx::query_as::<_, WorkRow>(
            "SELECT * FROM works WHERE revision_work_id = $1",
        )
        .bind(revision_work_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Work::try_from).collect()
    }

    async fn set_revision_work_result(
        &self,
        id: EntityId,
        state: WorkState,
        completed: bool,
    ) -> DbResult<()> {
        sqlx::query("UPDATE revision_works SET state = $2, completed = $3 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(state.to_string())
            .bind(completed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn blocked_revision_works(&self, lane_id: EntityId) -> DbResult<Vec<RevisionWork>> {
        let rows = sqlx::query_as::<_, RevisionWorkRow>(
            "SELECT * FROM revision_works WHERE lane_id = $1 AND state = $2",
        )
        .bind(lane_id.as_uuid())
        .bind(WorkState::DependencyNotFulfilled.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RevisionWork::try_from).collect()
    }

    async fn unblock_revision_works(&self, ids: &[EntityId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let blocked = WorkState::DependencyNotFulfilled.to_string();
        let runnable = WorkState::NotDone.to_string();
        let id_list = uuids(ids);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE works SET state = $1 WHERE revision_work_id = ANY($2) AND state = $3",
        )
        .bind(&runnable)
        .bind(&id_list)
        .bind(&blocked)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "UPDATE revision_works SET state = $1 WHERE id = ANY($2) AND state = $3",
        )
        .bind(&runnable)
        .bind(&id_list)
        .bind(&blocked)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn dependency_satisfied_revision_works(
        &self,
        dependency: &LaneDependency,
    ) -> DbResult<Vec<EntityId>> {
        let mut sql = String::from(
            r#"
            SELECT rw.id
            FROM revision_works rw
            INNER JOIN revisions r ON r.id = rw.revision_id
            WHERE rw.lane_id = $1 AND rw.state = $2
              AND EXISTS (
                SELECT 1
                FROM revision_works sub
                INNER JOIN revisions subr ON subr.id = sub.revision_id
                WHERE sub.completed = TRUE
                  AND sub.state = ANY($3)
                  AND subr.revision = r.revision
                  AND sub.lane_id = $4
            "#,
        );
        if dependency.dependent_host_id.is_some() {
            sql.push_str(" AND sub.host_id = $5");
        }
        sql.push_str(")");

        let mut query = sqlx::query_as::<_, (Uuid,)>(&sql)
            .bind(dependency.lane_id.as_uuid())
            .bind(WorkState::DependencyNotFulfilled.to_string())
            .bind(state_strings(dependency.condition.qualifying_states()))
            .bind(dependency.dependent_lane_id.as_uuid());
        if let Some(host_id) = dependency.dependent_host_id {
            query = query.bind(*host_id.as_uuid());
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id.into()).collect())
    }

    async fn is_dependency_satisfied(
        &self,
        dependency: &LaneDependency,
        revision: &str,
    ) -> DbResult<bool> {
        let mut sql = String::from(
            r#"
            SELECT rw.id
            FROM revision_works rw
            INNER JOIN revisions r ON r.id = rw.revision_id
            WHERE rw.lane_id = $1 AND rw.state = ANY($2) AND r.revision = $3
            "#,
        );
        let mut next_param = 4;
        if dependency.dependent_host_id.is_some() {
            sql.push_str(&format!(" AND rw.host_id = ${}", next_param));
            next_param += 1;
        }
        if dependency.filename.is_some() {
            sql.push_str(&format!(
                r#"
              AND EXISTS (
                SELECT 1 FROM work_files wf
                INNER JOIN works w ON w.id = wf.work_id
                WHERE w.revision_work_id = rw.id AND wf.filename = ${}
              )"#,
                next_param
            ));
        }
        sql.push_str(" LIMIT 1");

        let mut query = sqlx::query_as::<_, (Uuid,)>(&sql)
            .bind(dependency.dependent_lane_id.as_uuid())
            .bind(state_strings(dependency.condition.qualifying_states()))
            .bind(revision);
        if let Some(host_id) = dependency.dependent_host_id {
            query = query.bind(*host_id.as_uuid());
        }
        if let Some(filename) = &dependency.filename {
            query = query.bind(filename);
        }

        Ok(query.fetch_optional(&self.pool).await?.is_some())
    }

    async fn revision(&self, revision_id: EntityId) -> DbResult<Revision> {
        let row = sqlx::query_as::<_, RevisionRow>("SELECT * FROM revisions WHERE id = $1")
            .bind(revision_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("revision {}", revision_id)))?;
        Ok(row.into())
    }

    async fn add_work_file(&self, work_id: EntityId, filename: &str) -> DbResult<WorkFile> {
        let (id, work_id, filename) = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            r#"
            INSERT INTO work_files (id, work_id, filename)
            VALUES ($1, $2, $3)
            RETURNING id, work_id, filename
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(work_id.as_uuid())
        .bind(filename)
        .fetch_one(&self.pool)
        .await?;
        Ok(WorkFile {
            id: id.into(),
            work_id: work_id.into(),
            filename,
        })
    }
}
