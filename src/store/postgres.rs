//! # PostgreSQL Store
//!
//! Production [`Store`] backed by SQLx. Status changes are single conditional
//! `UPDATE ... WHERE id = $1 AND status = ANY($2) RETURNING ...` statements;
//! an update that touches no row is resolved into `NotFound` or
//! `StateMismatch` by re-reading the row.
//!
//! Job graphs, workflow data and result details are JSONB payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Assignment, CasResult, Holder, RunJobTransition, Store, UpsertResult};
use crate::config::DatabaseConfig;
use crate::error::{EngineError, Result};
use crate::models::{
    Entity, EntityLookup, EntityType, Hatchery, HatcheryStatus, Region, RegionGrant, RunInfo, RunJob,
    RunJobInfo, RunResult, VariableSet, VariableSetItem, Worker, WorkflowRun,
};
use crate::state_machine::{RunJobStatus, WorkflowRunStatus};

const RUN_COLUMNS: &str = "id, project_key, vcs_server, repository, workflow_name, workflow_ref, \
     workflow_sha, run_number, run_attempt, status, workflow_data, event, read_only, started, \
     last_modified";

const RUN_JOB_COLUMNS: &str = "id, job_id, workflow_run_id, project_key, workflow_name, \
     run_number, run_attempt, status, job, region, model_type, model_name, hatchery_name, \
     worker_name, spawn_attempts, queued, scheduled, started, ended";

const RUN_RESULT_COLUMNS: &str =
    "id, workflow_run_id, run_job_id, run_attempt, status, detail, issued_at";

const HATCHERY_COLUMNS: &str = "id, name, model_type, public_key, last_heartbeat, last_status";

const ENTITY_COLUMNS: &str = "id, project_key, vcs_server, repository, entity_type, name, \
     git_ref, commit_sha, file_path, data, last_update";

const WORKER_COLUMNS: &str =
    "id, name, hatchery_name, run_job_id, model_name, status, last_beat, os, arch, version";

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn parse_column<T: std::str::FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(EngineError::Database)
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        project_key: row.try_get("project_key")?,
        vcs_server: row.try_get("vcs_server")?,
        repository: row.try_get("repository")?,
        workflow_name: row.try_get("workflow_name")?,
        workflow_ref: row.try_get("workflow_ref")?,
        workflow_sha: row.try_get("workflow_sha")?,
        run_number: row.try_get("run_number")?,
        run_attempt: row.try_get("run_attempt")?,
        status: parse_column(row, "status")?,
        workflow_data: row.try_get::<Json<_>, _>("workflow_data")?.0,
        event: row.try_get::<Json<_>, _>("event")?.0,
        read_only: row.try_get("read_only")?,
        started: row.try_get("started")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn run_job_from_row(row: &PgRow) -> Result<RunJob> {
    Ok(RunJob {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        workflow_run_id: row.try_get("workflow_run_id")?,
        project_key: row.try_get("project_key")?,
        workflow_name: row.try_get("workflow_name")?,
        run_number: row.try_get("run_number")?,
        run_attempt: row.try_get("run_attempt")?,
        status: parse_column(row, "status")?,
        job: row.try_get::<Json<_>, _>("job")?.0,
        region: row.try_get("region")?,
        model_type: row.try_get("model_type")?,
        model_name: row.try_get("model_name")?,
        hatchery_name: row.try_get("hatchery_name")?,
        worker_name: row.try_get("worker_name")?,
        spawn_attempts: row.try_get("spawn_attempts")?,
        queued: row.try_get("queued")?,
        scheduled: row.try_get("scheduled")?,
        started: row.try_get("started")?,
        ended: row.try_get("ended")?,
    })
}

fn run_result_from_row(row: &PgRow) -> Result<RunResult> {
    Ok(RunResult {
        id: row.try_get("id")?,
        workflow_run_id: row.try_get("workflow_run_id")?,
        run_job_id: row.try_get("run_job_id")?,
        run_attempt: row.try_get("run_attempt")?,
        status: parse_column(row, "status")?,
        detail: row.try_get::<Json<_>, _>("detail")?.0,
        issued_at: row.try_get("issued_at")?,
    })
}

fn hatchery_from_row(row: &PgRow) -> Result<Hatchery> {
    let last_status: Option<Json<HatcheryStatus>> = row.try_get("last_status")?;
    Ok(Hatchery {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        model_type: row.try_get("model_type")?,
        public_key: row.try_get("public_key")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        last_status: last_status.map(|status| status.0),
    })
}

fn entity_from_row(row: &PgRow) -> Result<Entity> {
    Ok(Entity {
        id: row.try_get("id")?,
        project_key: row.try_get("project_key")?,
        vcs_server: row.try_get("vcs_server")?,
        repository: row.try_get("repository")?,
        entity_type: parse_column(row, "entity_type")?,
        name: row.try_get("name")?,
        git_ref: row.try_get("git_ref")?,
        commit: row.try_get("commit_sha")?,
        file_path: row.try_get("file_path")?,
        data: row.try_get("data")?,
        last_update: row.try_get("last_update")?,
    })
}

fn worker_from_row(row: &PgRow) -> Result<Worker> {
    Ok(Worker {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hatchery_name: row.try_get("hatchery_name")?,
        run_job_id: row.try_get("run_job_id")?,
        model_name: row.try_get("model_name")?,
        status: parse_column(row, "status")?,
        last_beat: row.try_get("last_beat")?,
        os: row.try_get("os")?,
        arch: row.try_get("arch")?,
        version: row.try_get("version")?,
    })
}

async fn insert_run_job(conn: &mut PgConnection, run_job: &RunJob) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO run_jobs ({RUN_JOB_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
    ))
    .bind(run_job.id)
    .bind(&run_job.job_id)
    .bind(run_job.workflow_run_id)
    .bind(&run_job.project_key)
    .bind(&run_job.workflow_name)
    .bind(run_job.run_number)
    .bind(run_job.run_attempt)
    .bind(run_job.status.as_str())
    .bind(Json(&run_job.job))
    .bind(&run_job.region)
    .bind(&run_job.model_type)
    .bind(&run_job.model_name)
    .bind(&run_job.hatchery_name)
    .bind(&run_job.worker_name)
    .bind(run_job.spawn_attempts)
    .bind(run_job.queued)
    .bind(run_job.scheduled)
    .bind(run_job.started)
    .bind(run_job.ended)
    .execute(conn)
    .await?;
    Ok(())
}

fn push_holder_condition(
    query: &mut QueryBuilder<'_, Postgres>,
    column: &'static str,
    holder: &Holder,
) {
    match holder {
        Holder::Any => {}
        Holder::Is(name) => {
            query.push(format!(" AND {column} = "));
            query.push_bind(name.clone());
        }
        Holder::Unassigned => {
            query.push(format!(" AND {column} IS NULL"));
        }
    }
}

fn push_assignment(
    query: &mut QueryBuilder<'_, Postgres>,
    column: &'static str,
    assignment: &Assignment,
) {
    match assignment {
        Assignment::Keep => {}
        Assignment::Set(name) => {
            query.push(format!(", {column} = "));
            query.push_bind(name.clone());
        }
        Assignment::Clear => {
            query.push(format!(", {column} = NULL"));
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "🐘 DATABASE: Connected scheduling store"
        );
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_cas_miss(&self, run_id: Uuid) -> Result<CasResult<WorkflowRun>> {
        Ok(match self.load_run(run_id).await? {
            Some(actual) => CasResult::StateMismatch { actual },
            None => CasResult::NotFound,
        })
    }

    async fn update_run_status(
        &self,
        conn: &mut PgConnection,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        next_attempt: i32,
    ) -> Result<Option<WorkflowRun>> {
        let from: Vec<String> = from.iter().map(|status| status.to_string()).collect();
        let row = sqlx::query(&format!(
            "UPDATE workflow_runs SET status = $1, run_attempt = $2, last_modified = NOW() \
             WHERE id = $3 AND run_attempt = $4 AND status = ANY($5) \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(next_attempt)
        .bind(run_id)
        .bind(run_attempt)
        .bind(from)
        .fetch_optional(conn)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO workflow_runs ({RUN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(run.id)
        .bind(&run.project_key)
        .bind(&run.vcs_server)
        .bind(&run.repository)
        .bind(&run.workflow_name)
        .bind(&run.workflow_ref)
        .bind(&run.workflow_sha)
        .bind(run.run_number)
        .bind(run.run_attempt)
        .bind(run.status.as_str())
        .bind(Json(&run.workflow_data))
        .bind(Json(&run.event))
        .bind(run.read_only)
        .bind(run.started)
        .bind(run.last_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn load_runs_by_status(&self, status: WorkflowRunStatus) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = $1 ORDER BY started, id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn complete_craft(
        &self,
        run: &WorkflowRun,
        run_jobs: &[RunJob],
    ) -> Result<CasResult<WorkflowRun>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE workflow_runs SET status = $1, workflow_data = $2, last_modified = NOW() \
             WHERE id = $3 AND run_attempt = $4 AND status = $5 \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(WorkflowRunStatus::Building.as_str())
        .bind(Json(&run.workflow_data))
        .bind(run.id)
        .bind(run.run_attempt)
        .bind(WorkflowRunStatus::Crafting.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            debug!(run_id = %run.id, "Run left Crafting before its jobs were stored");
            return self.run_cas_miss(run.id).await;
        };

        for run_job in run_jobs {
            insert_run_job(&mut tx, run_job).await?;
        }
        tx.commit().await?;
        Ok(CasResult::Success(run_from_row(&row)?))
    }

    async fn fail_craft(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        info: &RunInfo,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut tx = self.pool.begin().await?;
        let updated = self
            .update_run_status(
                &mut tx,
                run_id,
                run_attempt,
                &[WorkflowRunStatus::Crafting],
                WorkflowRunStatus::Fail,
                run_attempt,
            )
            .await?;

        let Some(run) = updated else {
            tx.rollback().await?;
            return self.run_cas_miss(run_id).await;
        };

        sqlx::query(
            "INSERT INTO workflow_run_infos (id, workflow_run_id, run_attempt, level, message, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(info.id)
        .bind(info.workflow_run_id)
        .bind(info.run_attempt)
        .bind(info.level.as_str())
        .bind(&info.message)
        .bind(info.issued_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(CasResult::Success(run))
    }

    async fn cas_run_status(
        &self,
        run_id: Uuid,
        run_attempt: i32,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut conn = self.pool.acquire().await?;
        match self
            .update_run_status(&mut conn, run_id, run_attempt, from, to, run_attempt)
            .await?
        {
            Some(run) => Ok(CasResult::Success(run)),
            None => self.run_cas_miss(run_id).await,
        }
    }

    async fn start_run_attempt(
        &self,
        run_id: Uuid,
        expected_attempt: i32,
    ) -> Result<CasResult<WorkflowRun>> {
        let mut conn = self.pool.acquire().await?;
        let terminal = [
            WorkflowRunStatus::Success,
            WorkflowRunStatus::Fail,
            WorkflowRunStatus::Cancelled,
        ];
        match self
            .update_run_status(
                &mut conn,
                run_id,
                expected_attempt,
                &terminal,
                WorkflowRunStatus::Crafting,
                expected_attempt + 1,
            )
            .await?
        {
            Some(run) => Ok(CasResult::Success(run)),
            None => self.run_cas_miss(run_id).await,
        }
    }

    async fn set_run_read_only(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET read_only = TRUE, last_modified = NOW() WHERE id = $1",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_run_info(&self, info: &RunInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_run_infos (id, workflow_run_id, run_attempt, level, message, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(info.id)
        .bind(info.workflow_run_id)
        .bind(info.run_attempt)
        .bind(info.level.as_str())
        .bind(&info.message)
        .bind(info.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run_infos(&self, run_id: Uuid) -> Result<Vec<RunInfo>> {
        let rows = sqlx::query(
            "SELECT id, workflow_run_id, run_attempt, level, message, issued_at \
             FROM workflow_run_infos WHERE workflow_run_id = $1 ORDER BY issued_at, id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RunInfo> {
                Ok(RunInfo {
                    id: row.try_get("id")?,
                    workflow_run_id: row.try_get("workflow_run_id")?,
                    run_attempt: row.try_get("run_attempt")?,
                    level: parse_column(row, "level")?,
                    message: row.try_get("message")?,
                    issued_at: row.try_get("issued_at")?,
                })
            })
            .collect()
    }

    async fn load_run_job(&self, run_job_id: Uuid) -> Result<Option<RunJob>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_JOB_COLUMNS} FROM run_jobs WHERE id = $1"
        ))
        .bind(run_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_job_from_row).transpose()
    }

    async fn load_run_jobs(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_JOB_COLUMNS} FROM run_jobs \
             WHERE workflow_run_id = $1 AND run_attempt = $2 ORDER BY job_id"
        ))
        .bind(run_id)
        .bind(run_attempt)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_job_from_row).collect()
    }

    async fn load_run_jobs_by_status(
        &self,
        status: RunJobStatus,
        region: Option<&str>,
    ) -> Result<Vec<RunJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_JOB_COLUMNS} FROM run_jobs \
             WHERE status = $1 AND ($2::TEXT IS NULL OR region = $2) \
             ORDER BY queued, id"
        ))
        .bind(status.as_str())
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_job_from_row).collect()
    }

    async fn transition_run_job(
        &self,
        run_job_id: Uuid,
        transition: &RunJobTransition,
    ) -> Result<CasResult<RunJob>> {
        let to = transition.to.as_str();
        let mut query = QueryBuilder::<Postgres>::new("UPDATE run_jobs SET status = ");
        query.push_bind(to);
        push_assignment(&mut query, "hatchery_name", &transition.hatchery);
        push_assignment(&mut query, "worker_name", &transition.worker);
        if transition.increment_spawn_attempts {
            query.push(", spawn_attempts = spawn_attempts + 1");
        }
        let timestamp = match transition.to {
            RunJobStatus::Scheduling => Some(("scheduled", "NOW()")),
            RunJobStatus::Waiting => Some(("scheduled", "NULL")),
            RunJobStatus::Building => Some(("started", "NOW()")),
            status if status.is_terminal() => Some(("ended", "NOW()")),
            _ => None,
        };
        if let Some((column, value)) = timestamp {
            query.push(format!(", {column} = CASE WHEN status <> "));
            query.push_bind(to);
            query.push(format!(" THEN {value} ELSE {column} END"));
        }

        let from: Vec<String> = transition.from.iter().map(|s| s.to_string()).collect();
        query.push(" WHERE id = ");
        query.push_bind(run_job_id);
        query.push(" AND status = ANY(");
        query.push_bind(from);
        query.push(")");
        push_holder_condition(&mut query, "hatchery_name", &transition.expected_hatchery);
        push_holder_condition(&mut query, "worker_name", &transition.expected_worker);
        query.push(format!(" RETURNING {RUN_JOB_COLUMNS}"));

        let row = query.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(CasResult::Success(run_job_from_row(&row)?)),
            None => Ok(match self.load_run_job(run_job_id).await? {
                Some(actual) => CasResult::StateMismatch { actual },
                None => CasResult::NotFound,
            }),
        }
    }

    async fn insert_run_job_info(&self, info: &RunJobInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_job_infos (id, workflow_run_id, run_job_id, level, message, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(info.id)
        .bind(info.workflow_run_id)
        .bind(info.run_job_id)
        .bind(info.level.as_str())
        .bind(&info.message)
        .bind(info.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_run_job_infos(&self, run_job_id: Uuid) -> Result<Vec<RunJobInfo>> {
        let rows = sqlx::query(
            "SELECT id, workflow_run_id, run_job_id, level, message, issued_at \
             FROM run_job_infos WHERE run_job_id = $1 ORDER BY issued_at, id",
        )
        .bind(run_job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RunJobInfo> {
                Ok(RunJobInfo {
                    id: row.try_get("id")?,
                    workflow_run_id: row.try_get("workflow_run_id")?,
                    run_job_id: row.try_get("run_job_id")?,
                    level: parse_column(row, "level")?,
                    message: row.try_get("message")?,
                    issued_at: row.try_get("issued_at")?,
                })
            })
            .collect()
    }

    async fn upsert_run_result(&self, result: &RunResult) -> Result<UpsertResult> {
        let row = sqlx::query(
            "INSERT INTO run_results \
             (id, workflow_run_id, run_job_id, run_attempt, kind, name, status, detail, issued_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (run_job_id, kind, name) DO UPDATE \
             SET status = EXCLUDED.status, detail = EXCLUDED.detail, issued_at = EXCLUDED.issued_at \
             WHERE run_results.status <> 'Completed' \
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(result.id)
        .bind(result.workflow_run_id)
        .bind(result.run_job_id)
        .bind(result.run_attempt)
        .bind(result.kind().as_str())
        .bind(result.name())
        .bind(result.status.as_str())
        .bind(Json(&result.detail))
        .bind(result.issued_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let inserted: bool = row.try_get("inserted")?;
            return Ok(if inserted {
                UpsertResult::Inserted
            } else {
                UpsertResult::Updated
            });
        }

        let existing = sqlx::query(&format!(
            "SELECT {RUN_RESULT_COLUMNS} FROM run_results \
             WHERE run_job_id = $1 AND kind = $2 AND name = $3"
        ))
        .bind(result.run_job_id)
        .bind(result.kind().as_str())
        .bind(result.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertResult::Rejected {
            existing: run_result_from_row(&existing)?,
        })
    }

    async fn load_run_results(&self, run_id: Uuid, run_attempt: i32) -> Result<Vec<RunResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_RESULT_COLUMNS} FROM run_results \
             WHERE workflow_run_id = $1 AND run_attempt = $2 ORDER BY issued_at, id"
        ))
        .bind(run_id)
        .bind(run_attempt)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_result_from_row).collect()
    }

    async fn insert_hatchery(&self, hatchery: &Hatchery) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO hatcheries ({HATCHERY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (name) DO NOTHING"
        ))
        .bind(hatchery.id)
        .bind(&hatchery.name)
        .bind(&hatchery.model_type)
        .bind(&hatchery.public_key)
        .bind(hatchery.last_heartbeat)
        .bind(hatchery.last_status.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "hatchery {} already exists",
                hatchery.name
            )));
        }
        Ok(())
    }

    async fn load_hatchery(&self, name: &str) -> Result<Option<Hatchery>> {
        let row = sqlx::query(&format!(
            "SELECT {HATCHERY_COLUMNS} FROM hatcheries WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(hatchery_from_row).transpose()
    }

    async fn load_hatcheries(&self) -> Result<Vec<Hatchery>> {
        let rows = sqlx::query(&format!(
            "SELECT {HATCHERY_COLUMNS} FROM hatcheries ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(hatchery_from_row).collect()
    }

    async fn record_heartbeat(
        &self,
        name: &str,
        at: DateTime<Utc>,
        status: &HatcheryStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE hatcheries SET last_heartbeat = $1, last_status = $2 WHERE name = $3",
        )
        .bind(at)
        .bind(Json(status))
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_region(&self, region: &Region) -> Result<()> {
        sqlx::query("INSERT INTO regions (id, name) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
            .bind(region.id)
            .bind(&region.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_region(&self, name: &str) -> Result<Option<Region>> {
        let row = sqlx::query("SELECT id, name FROM regions WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Region> {
            Ok(Region {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn insert_region_grant(&self, grant: &RegionGrant) -> Result<()> {
        sqlx::query(
            "INSERT INTO region_grants (region, hatchery_name, role) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&grant.region)
        .bind(&grant.hatchery_name)
        .bind(grant.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_region_grant(&self, grant: &RegionGrant) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM region_grants WHERE region = $1 AND hatchery_name = $2 AND role = $3",
        )
        .bind(&grant.region)
        .bind(&grant.hatchery_name)
        .bind(grant.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_region_grants(&self, region: &str) -> Result<Vec<RegionGrant>> {
        let rows = sqlx::query(
            "SELECT region, hatchery_name, role FROM region_grants \
             WHERE region = $1 ORDER BY hatchery_name, role",
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<RegionGrant> {
                Ok(RegionGrant {
                    region: row.try_get("region")?,
                    hatchery_name: row.try_get("hatchery_name")?,
                    role: parse_column(row, "role")?,
                })
            })
            .collect()
    }

    async fn insert_entity(&self, entity: &Entity) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO entities ({ENTITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(entity.id)
        .bind(&entity.project_key)
        .bind(&entity.vcs_server)
        .bind(&entity.repository)
        .bind(entity.entity_type.as_str())
        .bind(&entity.name)
        .bind(&entity.git_ref)
        .bind(&entity.commit)
        .bind(&entity.file_path)
        .bind(&entity.data)
        .bind(entity.last_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_entity(&self, lookup: &EntityLookup) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities \
             WHERE project_key = $1 AND vcs_server = $2 AND repository = $3 \
               AND entity_type = $4 AND name = $5 AND git_ref = $6 \
               AND ($7::TEXT IS NULL OR commit_sha = $7) \
             ORDER BY last_update DESC LIMIT 1"
        ))
        .bind(&lookup.repository.project_key)
        .bind(&lookup.repository.vcs_server)
        .bind(&lookup.repository.repository)
        .bind(lookup.entity_type.as_str())
        .bind(&lookup.name)
        .bind(&lookup.git_ref)
        .bind(&lookup.commit)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn find_project_entity(
        &self,
        project_key: &str,
        entity_type: EntityType,
        name: &str,
    ) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities \
             WHERE project_key = $1 AND entity_type = $2 AND name = $3 \
             ORDER BY last_update DESC LIMIT 1"
        ))
        .bind(project_key)
        .bind(entity_type.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn insert_variable_set(&self, variable_set: &VariableSet) -> Result<()> {
        sqlx::query(
            "INSERT INTO variable_sets (id, project_key, name, items) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (project_key, name) DO UPDATE SET items = EXCLUDED.items",
        )
        .bind(variable_set.id)
        .bind(&variable_set.project_key)
        .bind(&variable_set.name)
        .bind(Json(&variable_set.items))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_variable_set(
        &self,
        project_key: &str,
        name: &str,
    ) -> Result<Option<VariableSet>> {
        let row = sqlx::query(
            "SELECT id, project_key, name, items FROM variable_sets \
             WHERE project_key = $1 AND name = $2",
        )
        .bind(project_key)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<VariableSet> {
            Ok(VariableSet {
                id: row.try_get("id")?,
                project_key: row.try_get("project_key")?,
                name: row.try_get("name")?,
                items: row.try_get::<Json<Vec<VariableSetItem>>, _>("items")?.0,
            })
        })
        .transpose()
    }

    async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO workers ({WORKER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT (name) DO NOTHING"
        ))
        .bind(worker.id)
        .bind(&worker.name)
        .bind(&worker.hatchery_name)
        .bind(worker.run_job_id)
        .bind(&worker.model_name)
        .bind(worker.status.as_str())
        .bind(worker.last_beat)
        .bind(&worker.os)
        .bind(&worker.arch)
        .bind(&worker.version)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "worker {} already exists",
                worker.name
            )));
        }
        Ok(())
    }

    async fn load_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"))
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn load_worker_by_name(&self, name: &str) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workers SET status = $1, last_beat = $2, os = $3, arch = $4, version = $5 \
             WHERE id = $6",
        )
        .bind(worker.status.as_str())
        .bind(worker.last_beat)
        .bind(&worker.os)
        .bind(&worker.arch)
        .bind(&worker.version)
        .bind(worker.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("worker", worker.id));
        }
        Ok(())
    }
}
