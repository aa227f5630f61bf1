//! The `Repository`: every operation in spec.md §4.3, including the atomic
//! stuck-job harvest transaction (§4.5). Row mapping follows `mqk-db`'s
//! manual `Row::try_get` style rather than the `sqlx::query!` compile-time
//! macro, since this crate has no access to a live database at build time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobguard_circuit::{CircuitBreaker, CircuitBreakerError};
use jobguard_error::JobGuardError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Bull,
    BullMq,
    Bee,
}

impl Default for QueueType {
    fn default() -> Self {
        QueueType::Bull
    }
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Bull => "bull",
            QueueType::BullMq => "bullmq",
            QueueType::Bee => "bee",
        }
    }

    pub fn parse(s: &str) -> Result<Self, JobGuardError> {
        match s {
            "bull" => Ok(QueueType::Bull),
            "bullmq" => Ok(QueueType::BullMq),
            "bee" => Ok(QueueType::Bee),
            other => Err(JobGuardError::unsupported_queue(format!(
                "unrecognized queue_type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Stuck,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stuck => "stuck",
            JobStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, JobGuardError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stuck" => Ok(JobStatus::Stuck),
            "dead" => Ok(JobStatus::Dead),
            other => Err(JobGuardError::validation(format!(
                "unrecognized job status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue_name: String,
    pub queue_type: QueueType,
    pub job_id: String,
    pub job_name: Option<String>,
    pub data: Value,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            queue_type: QueueType::parse(&row.try_get::<String, _>("queue_type")?)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            job_id: row.try_get("job_id")?,
            job_name: row.try_get("job_name")?,
            data: row.try_get("data")?,
            status: JobStatus::parse(&row.try_get::<String, _>("status")?)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }
}

/// The outcome of §4.5's atomic stuck-job harvest.
#[derive(Debug, Default)]
pub struct StuckHarvest {
    pub to_reenqueue: Vec<JobRecord>,
    pub dead_ids: Vec<Uuid>,
}

/// Per-status counts for `stats()` (spec.md §6).
pub type StatusCounts = HashMap<String, i64>;

pub struct Repository {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
}

impl Repository {
    pub fn new(pool: PgPool, breaker: Arc<CircuitBreaker>) -> Self {
        Self { pool, breaker }
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, JobGuardError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        self.breaker.execute(op).await.map_err(|e| match e {
            CircuitBreakerError::Open => {
                JobGuardError::circuit_open("repository circuit breaker open")
            }
            CircuitBreakerError::Inner(err) => JobGuardError::postgres(err),
        })
    }

    /// UPSERT per spec.md §4.3: the `ON CONFLICT` predicate matches the
    /// partial unique index exactly, so a conflict can only ever be
    /// detected against a non-terminal existing row — a terminal row with
    /// the same business key simply isn't covered by the index, and the
    /// `INSERT` proceeds as an independent new row (spec.md §8 invariant 5).
    ///
    /// Returns `Ok(None)` only in the race window described in spec.md §9's
    /// open question: the conflicting row transitioned to terminal between
    /// the conflict being detected and the `DO UPDATE ... WHERE` guard
    /// re-checking it. Callers should treat `None` as "already settled
    /// elsewhere", not as an error.
    pub async fn insert_job(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
        job_name: Option<&str>,
        data: Value,
        max_attempts: i32,
    ) -> Result<Option<JobRecord>, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        self.guarded(move || async move {
            let row = sqlx::query(
                r#"
                insert into jobguard_jobs
                    (queue_name, queue_type, job_id, job_name, data, status, attempts, max_attempts)
                values
                    ($1, $2, $3, $4, $5, 'pending', 0, $6)
                on conflict (queue_name, queue_type, job_id)
                    where status not in ('completed', 'failed', 'dead')
                do update set
                    data = excluded.data,
                    job_name = excluded.job_name
                where jobguard_jobs.status not in ('completed', 'failed', 'dead')
                returning *
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .bind(job_name)
            .bind(data)
            .bind(max_attempts)
            .fetch_optional(&pool)
            .await?;

            row.as_ref().map(JobRecord::from_row).transpose()
        })
        .await
    }

    pub async fn update_job_status(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
        status: JobStatus,
    ) -> Result<Option<JobRecord>, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        let status_str = status.as_str();
        self.guarded(move || async move {
            let row = sqlx::query(
                r#"
                update jobguard_jobs
                set
                    status = $4,
                    started_at = case
                        when $4 = 'processing' and started_at is null then now()
                        else started_at
                    end,
                    last_heartbeat = case
                        when $4 = 'processing' then now()
                        else last_heartbeat
                    end,
                    completed_at = case
                        when $4 in ('completed', 'failed', 'dead') then now()
                        else completed_at
                    end
                where queue_name = $1 and queue_type = $2 and job_id = $3
                    and status not in ('completed', 'failed', 'dead')
                returning *
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .bind(status_str)
            .fetch_optional(&pool)
            .await?;

            row.as_ref().map(JobRecord::from_row).transpose()
        })
        .await
    }

    /// Atomically bumps `attempts` and computes the resulting status in SQL
    /// (`dead` iff `attempts + 1 >= max_attempts`, else `failed`) so a
    /// concurrent mutator can never observe a half-applied transition.
    /// `error_text` is expected to already be sanitized by the caller
    /// (spec.md §4.4); this method still hard-truncates to 5000 characters
    /// as a second line of defense.
    pub async fn update_job_error(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
        error_text: &str,
    ) -> Result<Option<JobRecord>, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        let truncated: String = error_text.chars().take(5000).collect();
        self.guarded(move || async move {
            let row = sqlx::query(
                r#"
                update jobguard_jobs
                set
                    attempts = attempts + 1,
                    error_message = $4,
                    status = case when attempts + 1 >= max_attempts then 'dead' else 'failed' end,
                    completed_at = now()
                where queue_name = $1 and queue_type = $2 and job_id = $3
                    and status not in ('completed', 'failed', 'dead')
                returning *
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .bind(truncated)
            .fetch_optional(&pool)
            .await?;

            row.as_ref().map(JobRecord::from_row).transpose()
        })
        .await
    }

    /// Atomically bumps `attempts` and returns the row to `pending`
    /// (spec.md §4.6 step 3's re-enqueue). Bumping `attempts` here, not at
    /// harvest time, is what lets a repeatedly-stuck job eventually cross
    /// `max_attempts` and partition to `dead` on a later harvest.
    pub async fn mark_reenqueued(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
    ) -> Result<Option<JobRecord>, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        self.guarded(move || async move {
            let row = sqlx::query(
                r#"
                update jobguard_jobs
                set
                    status = 'pending',
                    attempts = attempts + 1,
                    started_at = null,
                    last_heartbeat = null
                where queue_name = $1 and queue_type = $2 and job_id = $3
                    and status not in ('completed', 'failed', 'dead')
                returning *
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .fetch_optional(&pool)
            .await?;

            row.as_ref().map(JobRecord::from_row).transpose()
        })
        .await
    }

    /// Sets `last_heartbeat` only while the row is `processing`; a silent
    /// no-op otherwise (spec.md §4.3 — a missed or late heartbeat is never
    /// an error).
    pub async fn update_heartbeat(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
    ) -> Result<bool, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        self.guarded(move || async move {
            let result = sqlx::query(
                r#"
                update jobguard_jobs
                set last_heartbeat = now()
                where queue_name = $1 and queue_type = $2 and job_id = $3 and status = 'processing'
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .execute(&pool)
            .await?;

            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// The atomic stuck-job harvest (spec.md §4.5). A single transaction:
    /// selects stale `processing` rows with `FOR UPDATE SKIP LOCKED` so
    /// concurrent reconcilers never double-claim, marks them `stuck`, then
    /// immediately partitions and finalizes the exhausted ones to `dead`.
    pub async fn get_and_mark_stuck_jobs(
        &self,
        queue_name: &str,
        threshold_ms: i64,
        batch_size: i64,
    ) -> Result<StuckHarvest, JobGuardError> {
        let pool = self.pool.clone();
        let queue_name = queue_name.to_string();
        self.guarded(move || async move {
            let mut tx = pool.begin().await?;

            let stuck_rows = sqlx::query(
                r#"
                with candidates as (
                    select id
                    from jobguard_jobs
                    where queue_name = $1
                        and status = 'processing'
                        and coalesce(last_heartbeat, updated_at) < now() - ($2 || ' milliseconds')::interval
                    order by coalesce(last_heartbeat, updated_at) asc
                    limit $3
                    for update skip locked
                )
                update jobguard_jobs j
                set status = 'stuck'
                from candidates c
                where j.id = c.id
                returning j.*
                "#,
            )
            .bind(&queue_name)
            .bind(threshold_ms.to_string())
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .await?;

            let mut harvest = StuckHarvest::default();
            let mut dead_ids = Vec::new();
            for row in &stuck_rows {
                let record = JobRecord::from_row(row)?;
                if record.attempts < record.max_attempts {
                    harvest.to_reenqueue.push(record);
                } else {
                    dead_ids.push(record.id);
                }
            }

            if !dead_ids.is_empty() {
                sqlx::query(
                    r#"
                    update jobguard_jobs
                    set status = 'dead', completed_at = now()
                    where id = any($1)
                    "#,
                )
                .bind(dead_ids.as_slice())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            harvest.dead_ids = dead_ids;
            Ok(harvest)
        })
        .await
    }

    pub async fn bulk_update_status(
        &self,
        ids: &[Uuid],
        status: JobStatus,
    ) -> Result<u64, JobGuardError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let pool = self.pool.clone();
        let ids = ids.to_vec();
        let status_str = status.as_str();
        self.guarded(move || async move {
            let result = sqlx::query(
                r#"
                update jobguard_jobs
                set status = $2,
                    completed_at = case when $2 in ('completed', 'failed', 'dead') then now() else completed_at end
                where id = any($1)
                "#,
            )
            .bind(ids.as_slice())
            .bind(status_str)
            .execute(&pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    pub async fn bulk_mark_dead(&self, ids: &[Uuid]) -> Result<u64, JobGuardError> {
        self.bulk_update_status(ids, JobStatus::Dead).await
    }

    pub async fn delete_old_jobs(&self, retention_days: i64) -> Result<u64, JobGuardError> {
        let pool = self.pool.clone();
        self.guarded(move || async move {
            let result = sqlx::query(
                r#"
                delete from jobguard_jobs
                where status in ('completed', 'failed', 'dead')
                    and completed_at < now() - ($1 || ' days')::interval
                "#,
            )
            .bind(retention_days.to_string())
            .execute(&pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    pub async fn get_statistics(&self, queue_name: &str) -> Result<StatusCounts, JobGuardError> {
        let pool = self.pool.clone();
        let queue_name = queue_name.to_string();
        self.guarded(move || async move {
            let rows = sqlx::query(
                r#"
                select status, count(*)::bigint as n
                from jobguard_jobs
                where queue_name = $1
                group by status
                "#,
            )
            .bind(&queue_name)
            .fetch_all(&pool)
            .await?;

            let mut counts = StatusCounts::new();
            for row in rows {
                let status: String = row.try_get("status")?;
                let n: i64 = row.try_get("n")?;
                counts.insert(status, n);
            }
            Ok(counts)
        })
        .await
    }

    /// Most recent row for the business key — there may be multiple
    /// terminal reincarnations, so this orders by `created_at desc`.
    pub async fn get_job(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
    ) -> Result<Option<JobRecord>, JobGuardError> {
        let pool = self.pool.clone();
        let queue_type_str = queue_type.as_str();
        self.guarded(move || async move {
            let row = sqlx::query(
                r#"
                select * from jobguard_jobs
                where queue_name = $1 and queue_type = $2 and job_id = $3
                order by created_at desc
                limit 1
                "#,
            )
            .bind(queue_name)
            .bind(queue_type_str)
            .bind(job_id)
            .fetch_optional(&pool)
            .await?;

            row.as_ref().map(JobRecord::from_row).transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_type_round_trips() {
        for qt in [QueueType::Bull, QueueType::BullMq, QueueType::Bee] {
            assert_eq!(QueueType::parse(qt.as_str()).unwrap().as_str(), qt.as_str());
        }
    }

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Stuck.is_terminal());
    }

    #[test]
    fn unsupported_queue_type_rejected() {
        assert!(QueueType::parse("sidekiq").is_err());
    }

    #[test]
    fn invalid_job_status_rejected() {
        assert!(JobStatus::parse("running").is_err());
    }
}
