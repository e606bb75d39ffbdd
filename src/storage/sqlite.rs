//! SQLite job store.
//!
//! Provides persistent storage using SQLite. Conditional updates use an
//! optimistic version column: the job is read, the transition is validated
//! in memory, and the write only lands if the version is unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use super::{DeadLetterRecord, JobFilter, JobStore, StorageError};
use crate::core::job::{Job, JobStatus, JobType};
use crate::core::log::ExecutionLog;
use crate::core::schedule::JobSchedule;
use crate::core::state::Transition;
use crate::core::types::JobId;

const JOB_COLUMNS: &str = "id, name, description, job_type, status, payload, priority, \
    max_retries, current_retry_count, exhausted, created_by, created_at, updated_at, \
    scheduled_at, started_at, completed_at, error_message, version";

const SCHEDULE_COLUMNS: &str = "job_id, schedule_type, cron_expression, execution_time, \
    next_execution, last_execution, is_active, timezone, created_at, updated_at";

/// SQLite job store.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_job(&self, id: &JobId) -> Result<JobRow, StorageError> {
        sqlx::query_as::<_, JobRow>(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }
}

fn other(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_id(s: &str) -> Result<JobId, StorageError> {
    s.parse()
        .map_err(|e| StorageError::SerializationError(format!("job id '{}': {}", s, e)))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, StorageError> {
    s.parse().map_err(StorageError::SerializationError)
}

fn to_u32(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{} out of range: {}", column, value)))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    description: Option<String>,
    job_type: String,
    status: String,
    payload: Option<String>,
    priority: i64,
    max_retries: i64,
    current_retry_count: i64,
    exhausted: bool,
    created_by: Option<String>,
    created_at: i64,
    updated_at: i64,
    scheduled_at: Option<i64>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_message: Option<String>,
    version: i64,
}

impl JobRow {
    fn into_job(self) -> Result<Job, StorageError> {
        Ok(Job {
            id: parse_id(&self.id)?,
            name: self.name,
            description: self.description,
            job_type: parse_enum(&self.job_type)?,
            status: parse_enum(&self.status)?,
            payload: self.payload,
            priority: i32::try_from(self.priority).map_err(|_| {
                StorageError::SerializationError(format!("priority out of range: {}", self.priority))
            })?,
            max_retries: to_u32(self.max_retries, "max_retries")?,
            current_retry_count: to_u32(self.current_retry_count, "current_retry_count")?,
            exhausted: self.exhausted,
            created_by: self.created_by,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            scheduled_at: self.scheduled_at.map(from_millis),
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            error_message: self.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    job_id: String,
    schedule_type: String,
    cron_expression: Option<String>,
    execution_time: Option<i64>,
    next_execution: Option<i64>,
    last_execution: Option<i64>,
    is_active: bool,
    timezone: String,
    created_at: i64,
    updated_at: i64,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<JobSchedule, StorageError> {
        Ok(JobSchedule {
            job_id: parse_id(&self.job_id)?,
            schedule_type: parse_enum(&self.schedule_type)?,
            cron_expression: self.cron_expression,
            execution_time: self.execution_time.map(from_millis),
            next_execution: self.next_execution.map(from_millis),
            last_execution: self.last_execution.map(from_millis),
            is_active: self.is_active,
            timezone: self.timezone,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    job_id: String,
    level: String,
    message: String,
    details: Option<String>,
    executed_at: i64,
    duration_ms: Option<i64>,
    worker: Option<String>,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    job_id: String,
    job_name: String,
    reason: String,
    final_retry_count: i64,
    max_retries: i64,
    payload: Option<String>,
    error_message: Option<String>,
    recorded_at: i64,
}

impl DeadLetterRow {
    fn into_record(self) -> Result<DeadLetterRecord, StorageError> {
        Ok(DeadLetterRecord {
            job_id: parse_id(&self.job_id)?,
            job_name: self.job_name,
            reason: self.reason,
            final_retry_count: to_u32(self.final_retry_count, "final_retry_count")?,
            max_retries: to_u32(self.max_retries, "max_retries")?,
            payload: self.payload,
            error_message: self.error_message,
            recorded_at: from_millis(self.recorded_at),
        })
    }
}

fn push_in<'a>(qb: &mut QueryBuilder<'a, Sqlite>, column: &str, values: Vec<&'static str>) {
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: Job) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, name, description, job_type, status, payload, priority,
                max_retries, current_retry_count, exhausted, created_by, created_at, updated_at,
                scheduled_at, started_at, completed_at, error_message, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(&job.description)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(i64::from(job.priority))
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.current_retry_count))
        .bind(job.exhausted)
        .bind(&job.created_by)
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .bind(job.scheduled_at.map(to_millis))
        .bind(job.started_at.map(to_millis))
        .bind(job.completed_at.map(to_millis))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        self.fetch_job(id).await?.into_job()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS));

        if !filter.statuses.is_empty() {
            push_in(
                &mut qb,
                "status",
                filter.statuses.iter().map(|s| s.as_str()).collect(),
            );
        }
        if !filter.job_types.is_empty() {
            push_in(
                &mut qb,
                "job_type",
                filter.job_types.iter().map(|t| t.as_str()).collect(),
            );
        }
        if let Some(owner) = &filter.created_by {
            qb.push(" AND created_by = ").push_bind(owner.clone());
        }
        if let Some(exhausted) = filter.exhausted {
            qb.push(" AND exhausted = ").push_bind(exhausted);
        }
        if let Some(at) = filter.scheduled_before {
            qb.push(" AND scheduled_at <= ").push_bind(to_millis(at));
        }
        if let Some(at) = filter.started_before {
            qb.push(" AND started_at < ").push_bind(to_millis(at));
        }
        if let Some(at) = filter.completed_before {
            qb.push(" AND completed_at < ").push_bind(to_millis(at));
        }
        if let Some(at) = filter.updated_before {
            qb.push(" AND updated_at < ").push_bind(to_millis(at));
        }
        if let Some(at) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(to_millis(at));
        }
        if let Some(at) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(to_millis(at));
        }

        qb.push(" ORDER BY priority DESC, scheduled_at IS NULL, scheduled_at ASC, created_at ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<JobRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(other)?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn transition(
        &self,
        id: &JobId,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Job, StorageError> {
        let row = self.fetch_job(id).await?;
        let version = row.version;
        let mut job = row.into_job()?;
        job.apply(transition, at)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?, current_retry_count = ?, exhausted = ?,
                scheduled_at = ?, started_at = ?, completed_at = ?, error_message = ?,
                updated_at = ?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.current_retry_count))
        .bind(job.exhausted)
        .bind(job.scheduled_at.map(to_millis))
        .bind(job.started_at.map(to_millis))
        .bind(job.completed_at.map(to_millis))
        .bind(&job.error_message)
        .bind(to_millis(job.updated_at))
        .bind(id.to_string())
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "job {} changed during {}",
                id,
                transition.name()
            )));
        }
        Ok(job)
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(other)?;

        sqlx::query("DELETE FROM execution_logs WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;
        sqlx::query("DELETE FROM job_schedules WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        tx.commit().await.map_err(other)?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(other)?;

        rows.into_iter()
            .map(|(status, count)| Ok((parse_enum(&status)?, count.max(0) as u64)))
            .collect()
    }

    async fn count_by_type(&self) -> Result<BTreeMap<JobType, u64>, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT job_type, COUNT(*) FROM jobs GROUP BY job_type")
                .fetch_all(&self.pool)
                .await
                .map_err(other)?;

        rows.into_iter()
            .map(|(job_type, count)| Ok((parse_enum(&job_type)?, count.max(0) as u64)))
            .collect()
    }

    async fn save_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_schedules (job_id, schedule_type, cron_expression, execution_time,
                next_execution, last_execution, is_active, timezone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.job_id.to_string())
        .bind(schedule.schedule_type.as_str())
        .bind(&schedule.cron_expression)
        .bind(schedule.execution_time.map(to_millis))
        .bind(schedule.next_execution.map(to_millis))
        .bind(schedule.last_execution.map(to_millis))
        .bind(schedule.is_active)
        .bind(&schedule.timezone)
        .bind(to_millis(schedule.created_at))
        .bind(to_millis(schedule.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::DuplicateKey(format!("schedule: {}", schedule.job_id)),
            ),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(StorageError::NotFound(format!("job: {}", schedule.job_id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn get_schedule(&self, job_id: &JobId) -> Result<Option<JobSchedule>, StorageError> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_schedules WHERE job_id = ?",
            SCHEDULE_COLUMNS
        ))
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(other)?;

        row.map(ScheduleRow::into_schedule).transpose()
    }

    async fn update_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE job_schedules SET schedule_type = ?, cron_expression = ?, execution_time = ?,
                next_execution = ?, last_execution = ?, is_active = ?, timezone = ?, updated_at = ?
            WHERE job_id = ?
            "#,
        )
        .bind(schedule.schedule_type.as_str())
        .bind(&schedule.cron_expression)
        .bind(schedule.execution_time.map(to_millis))
        .bind(schedule.next_execution.map(to_millis))
        .bind(schedule.last_execution.map(to_millis))
        .bind(schedule.is_active)
        .bind(&schedule.timezone)
        .bind(to_millis(schedule.updated_at))
        .bind(schedule.job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "schedule: {}",
                schedule.job_id
            )));
        }
        Ok(())
    }

    async fn advance_schedule(
        &self,
        schedule: JobSchedule,
        expected_next: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE job_schedules SET schedule_type = ?, cron_expression = ?, execution_time = ?,
                next_execution = ?, last_execution = ?, is_active = ?, timezone = ?, updated_at = ?
            WHERE job_id = ? AND is_active = 1 AND next_execution IS ?
            "#,
        )
        .bind(schedule.schedule_type.as_str())
        .bind(&schedule.cron_expression)
        .bind(schedule.execution_time.map(to_millis))
        .bind(schedule.next_execution.map(to_millis))
        .bind(schedule.last_execution.map(to_millis))
        .bind(schedule.is_active)
        .bind(&schedule.timezone)
        .bind(to_millis(schedule.updated_at))
        .bind(schedule.job_id.to_string())
        .bind(expected_next.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            if self.get_schedule(&schedule.job_id).await?.is_none() {
                return Err(StorageError::NotFound(format!(
                    "schedule: {}",
                    schedule.job_id
                )));
            }
            return Err(StorageError::Conflict(format!(
                "schedule {} already advanced",
                schedule.job_id
            )));
        }
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobSchedule>, StorageError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_schedules WHERE is_active = 1 AND next_execution <= ? \
             ORDER BY next_execution ASC",
            SCHEDULE_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    async fn append_log(&self, log: ExecutionLog) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_logs (job_id, level, message, details, executed_at,
                duration_ms, worker)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.job_id.to_string())
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.details)
        .bind(to_millis(log.executed_at))
        .bind(log.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
        .bind(&log.worker)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(StorageError::NotFound(format!("job: {}", log.job_id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn list_logs(&self, job_id: &JobId) -> Result<Vec<ExecutionLog>, StorageError> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT job_id, level, message, details, executed_at, duration_ms, worker \
             FROM execution_logs WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.into_iter()
            .map(|row| {
                Ok(ExecutionLog {
                    job_id: parse_id(&row.job_id)?,
                    level: parse_enum(&row.level)?,
                    message: row.message,
                    details: row.details,
                    executed_at: from_millis(row.executed_at),
                    duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
                    worker: row.worker,
                })
            })
            .collect()
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (job_id, job_name, reason, final_retry_count, max_retries,
                payload, error_message, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.job_name)
        .bind(&record.reason)
        .bind(i64::from(record.final_retry_count))
        .bind(i64::from(record.max_retries))
        .bind(&record.payload)
        .bind(&record.error_message)
        .bind(to_millis(record.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(other)?;
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT job_id, job_name, reason, final_retry_count, max_retries, payload, \
             error_message, recorded_at FROM dead_letters ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.into_iter().map(DeadLetterRow::into_record).collect()
    }

    async fn dead_letters_for(&self, job_id: &JobId) -> Result<Vec<DeadLetterRecord>, StorageError> {
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            "SELECT job_id, job_name, reason, final_retry_count, max_retries, payload, \
             error_message, recorded_at FROM dead_letters WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.into_iter().map(DeadLetterRow::into_record).collect()
    }
}
