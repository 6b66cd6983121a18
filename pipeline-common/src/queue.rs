//! # Queue
//!
//! A durable job queue backed by a single PostgreSQL table (`jobq`), with an
//! append-only audit log (`jobq_log`). Entries are claimed with
//! `FOR UPDATE SKIP LOCKED` so many workers can race against the same
//! entrypoint without double-claiming a row.
//!
//! Enqueuing must be possible from inside a caller-owned transaction: a
//! queued job that references a trial row is only useful once that trial row
//! is itself visible, so `enqueue` takes any `sqlx::PgExecutor` rather than
//! opening its own connection.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgExecutor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Lifecycle of a row in `jobq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker for its entrypoint.
    Queued,
    /// Claimed by a worker; exactly one worker may hold a row in this state.
    Picked,
    /// Handler returned Ok.
    Success,
    /// Handler returned Err; subject to the caller's own retry bookkeeping.
    Failed,
    /// Cancelled before being claimed.
    Cancelled,
}

pub type JobPayload<J> = sqlx::types::Json<J>;

/// A row claimed from `jobq`.
#[derive(Debug, sqlx::FromRow)]
pub struct Job<J> {
    pub id: i64,
    pub priority: i32,
    pub entrypoint: String,
    pub payload: JobPayload<J>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// Enqueue one job, keyed by `entrypoint` (the canonical queue key). Must be
/// called with an executor borrowed from the caller's own transaction so the
/// queued row only becomes visible alongside whatever domain row it refers
/// to.
pub async fn enqueue<'e, E, J>(
    executor: E,
    entrypoint: &str,
    payload: &J,
    priority: i32,
) -> QueueResult<i64>
where
    E: PgExecutor<'e>,
    J: Serialize + Sync,
{
    enqueue_delayed(executor, entrypoint, payload, priority, chrono::Duration::zero()).await
}

/// Same as [`enqueue`] but the row only becomes claimable once `delay` has
/// elapsed. Used by the trial handler to schedule an automatic retry without
/// making it immediately re-claimable, independent of the slot lease clock.
pub async fn enqueue_delayed<'e, E, J>(
    executor: E,
    entrypoint: &str,
    payload: &J,
    priority: i32,
    delay: chrono::Duration,
) -> QueueResult<i64>
where
    E: PgExecutor<'e>,
    J: Serialize + Sync,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO jobq (priority, entrypoint, payload, status, scheduled_at, created_at, updated_at)
        VALUES ($1, $2, $3, 'queued', NOW() + $4::interval, NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(priority)
    .bind(entrypoint)
    .bind(sqlx::types::Json(payload))
    .bind(delay)
    .fetch_one(executor)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "INSERT jobq".to_owned(),
        error,
    })?;

    Ok(row.0)
}

/// Append a row to the audit log. Best-effort: failures are logged by the
/// caller, never propagated, since the log is diagnostic only.
pub async fn log<'e, E>(executor: E, job_id: i64, entrypoint: &str, status: &str) -> QueueResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO jobq_log (job_id, status, entrypoint, at)
        VALUES ($1, $2, $3, NOW())
        "#,
    )
    .bind(job_id)
    .bind(status)
    .bind(entrypoint)
    .execute(executor)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "INSERT jobq_log".to_owned(),
        error,
    })?;

    Ok(())
}

/// Claim the highest-priority queued job for `entrypoint`, if any, marking it
/// `picked`. Uses `SKIP LOCKED` so concurrent claimants never see the same
/// row twice.
pub async fn claim_one<J: DeserializeOwned + Send + Unpin + 'static>(
    pool: &PgPool,
    entrypoint: &str,
) -> QueueResult<Option<Job<J>>> {
    let job: Option<Job<J>> = sqlx::query_as(
        r#"
        WITH available AS (
            SELECT id
            FROM jobq
            WHERE status = 'queued'
              AND entrypoint = $1
              AND scheduled_at <= NOW()
            ORDER BY priority DESC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE jobq
        SET status = 'picked', updated_at = NOW()
        FROM available
        WHERE jobq.id = available.id
        RETURNING jobq.id, jobq.priority, jobq.entrypoint, jobq.payload, jobq.status, jobq.created_at
        "#,
    )
    .bind(entrypoint)
    .fetch_optional(pool)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "UPDATE jobq (claim)".to_owned(),
        error,
    })?;

    Ok(job)
}

/// Mark a claimed job terminal.
pub async fn complete(pool: &PgPool, job_id: i64, status: JobStatus) -> QueueResult<()> {
    sqlx::query(
        r#"
        UPDATE jobq
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(status)
    .execute(pool)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "UPDATE jobq (complete)".to_owned(),
        error,
    })?;

    Ok(())
}

/// Cancel queued jobs whose JSON payload has `field_name` equal to one of
/// `values`. Used when a trial or task is deleted out from under the queue;
/// in-flight (`picked`) jobs are left alone to run to completion.
pub async fn cancel_by_field<'e, E>(
    executor: E,
    field_name: &str,
    values: &[String],
) -> QueueResult<u64>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE jobq
        SET status = 'cancelled', updated_at = NOW()
        WHERE status = 'queued'
          AND payload ->> $1 = ANY($2)
        "#,
    )
    .bind(field_name)
    .bind(values)
    .execute(executor)
    .await
    .map_err(|error| QueueError::QueryError {
        command: "UPDATE jobq (cancel)".to_owned(),
        error,
    })?;

    Ok(result.rows_affected())
}

/// Build a connection pool sized for the small-footprint workers and
/// dispatcher this queue is meant to serve (see design notes on pool
/// sizing: a worker handles one job at a time and the dispatcher issues a
/// handful of short queries per cycle).
pub async fn connect(url: &str, min_connections: u32, max_connections: u32) -> QueueResult<PgPool> {
    PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|error| QueueError::ConnectionError { error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TrialPayload {
        job_type: String,
        trial_id: String,
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn enqueue_then_claim_round_trips(pool: PgPool) {
        let payload = TrialPayload {
            job_type: "trial".to_owned(),
            trial_id: "task-1-0".to_owned(),
        };

        let job_id = enqueue(&pool, "anthropic/claude", &payload, 0)
            .await
            .expect("enqueue failed");

        let claimed: Job<TrialPayload> = claim_one(&pool, "anthropic/claude")
            .await
            .expect("claim failed")
            .expect("expected a claimable job");

        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Picked);
        assert_eq!(claimed.payload.0, payload);

        let second = claim_one::<TrialPayload>(&pool, "anthropic/claude")
            .await
            .expect("claim failed");
        assert!(second.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn cancel_by_field_skips_picked_rows(pool: PgPool) {
        let payload = TrialPayload {
            job_type: "trial".to_owned(),
            trial_id: "task-2-0".to_owned(),
        };
        enqueue(&pool, "default", &payload, 0)
            .await
            .expect("enqueue failed");

        let cancelled = cancel_by_field(&pool, "trial_id", &["task-2-0".to_owned()])
            .await
            .expect("cancel failed");
        assert_eq!(cancelled, 1);

        let claimed = claim_one::<TrialPayload>(&pool, "default")
            .await
            .expect("claim failed");
        assert!(claimed.is_none());
    }
}
