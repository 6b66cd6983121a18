//! # Slot lessor
//!
//! Caps concurrent in-flight jobs per queue key using a lease table
//! (`slots`) independent of the job queue itself. A lease is a time-bounded
//! claim on one (queue_key, slot) pair; a worker that crashes without
//! releasing still yields its slot once the lease expires, so this clock is
//! kept deliberately separate from the queue's own retry timer.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

pub type SlotResult<T> = std::result::Result<T, SlotError>;

/// Idempotently make sure `limit` slots exist for `queue_key`. Safe to call
/// on every acquire attempt; a shrinking limit leaves the excess rows in
/// place (they simply never get re-leased above the new limit because the
/// caller never asks `acquire` to look past it).
pub async fn ensure_slots(pool: &PgPool, queue_key: &str, limit: i32) -> SlotResult<()> {
    sqlx::query(
        r#"
        INSERT INTO slots (queue_key, slot, locked_by, locked_until)
        SELECT $1, generate_series(0, $2 - 1), NULL, NULL
        ON CONFLICT (queue_key, slot) DO NOTHING
        "#,
    )
    .bind(queue_key)
    .bind(limit)
    .execute(pool)
    .await
    .map_err(|error| SlotError::QueryError {
        command: "INSERT slots".to_owned(),
        error,
    })?;

    Ok(())
}

/// Try to acquire one free (or expired) slot for `queue_key`. Returns the
/// slot index on success.
pub async fn acquire(
    pool: &PgPool,
    queue_key: &str,
    limit: i32,
    worker_id: &str,
    lease: Duration,
) -> SlotResult<Option<i32>> {
    ensure_slots(pool, queue_key, limit).await?;

    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        WITH free AS (
            SELECT slot
            FROM slots
            WHERE queue_key = $1
              AND (locked_until IS NULL OR locked_until <= NOW())
            ORDER BY slot
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE slots
        SET locked_by = $2, locked_until = NOW() + $3::interval
        FROM free
        WHERE slots.queue_key = $1
          AND slots.slot = free.slot
        RETURNING slots.slot
        "#,
    )
    .bind(queue_key)
    .bind(worker_id)
    .bind(lease)
    .fetch_optional(pool)
    .await
    .map_err(|error| SlotError::QueryError {
        command: "UPDATE slots (acquire)".to_owned(),
        error,
    })?;

    Ok(row.map(|(slot,)| slot))
}

/// Release a held slot. Only clears the lease if `worker_id` still owns it,
/// so a worker racing its own expired-and-reissued lease cannot clobber
/// whoever picked it up next.
pub async fn release(pool: &PgPool, queue_key: &str, slot: i32, worker_id: &str) -> SlotResult<()> {
    sqlx::query(
        r#"
        UPDATE slots
        SET locked_by = NULL, locked_until = NULL
        WHERE queue_key = $1
          AND slot = $2
          AND locked_by = $3
        "#,
    )
    .bind(queue_key)
    .bind(slot)
    .bind(worker_id)
    .execute(pool)
    .await
    .map_err(|error| SlotError::QueryError {
        command: "UPDATE slots (release)".to_owned(),
        error,
    })?;

    Ok(())
}

/// Clear every lease past its deadline. Run periodically by the dispatcher.
pub async fn sweep_expired(pool: &PgPool) -> SlotResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE slots
        SET locked_by = NULL, locked_until = NULL
        WHERE locked_until IS NOT NULL
          AND locked_until <= NOW()
        "#,
    )
    .execute(pool)
    .await
    .map_err(|error| SlotError::QueryError {
        command: "UPDATE slots (sweep)".to_owned(),
        error,
    })?;

    Ok(result.rows_affected())
}

/// Count currently-live leases for a queue key. Exposed for tests and
/// metrics; not on the hot path.
pub async fn live_lease_count(pool: &PgPool, queue_key: &str) -> SlotResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM slots
        WHERE queue_key = $1 AND locked_until > NOW()
        "#,
    )
    .bind(queue_key)
    .fetch_one(pool)
    .await
    .map_err(|error| SlotError::QueryError {
        command: "SELECT slots (count)".to_owned(),
        error,
    })?;

    Ok(row.0)
}

#[allow(dead_code)]
fn _expiry_hint(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + lease
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    async fn acquire_respects_limit(pool: PgPool) {
        let lease = Duration::seconds(30);
        let first = acquire(&pool, "anthropic/claude", 2, "worker-a", lease)
            .await
            .expect("acquire failed");
        let second = acquire(&pool, "anthropic/claude", 2, "worker-b", lease)
            .await
            .expect("acquire failed");
        let third = acquire(&pool, "anthropic/claude", 2, "worker-c", lease)
            .await
            .expect("acquire failed");

        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
        assert_ne!(first, second);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn release_requires_matching_owner(pool: PgPool) {
        let lease = Duration::seconds(30);
        let slot = acquire(&pool, "default", 1, "worker-a", lease)
            .await
            .expect("acquire failed")
            .expect("expected a slot");

        release(&pool, "default", slot, "worker-b")
            .await
            .expect("release should not error even if owner mismatches");

        let still_taken = acquire(&pool, "default", 1, "worker-c", lease)
            .await
            .expect("acquire failed");
        assert!(still_taken.is_none());

        release(&pool, "default", slot, "worker-a")
            .await
            .expect("release failed");
        let now_free = acquire(&pool, "default", 1, "worker-c", lease)
            .await
            .expect("acquire failed");
        assert!(now_free.is_some());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn sweep_frees_expired_leases(pool: PgPool) {
        let expired = Duration::seconds(-1);
        acquire(&pool, "default", 1, "worker-a", expired)
            .await
            .expect("acquire failed");

        let swept = sweep_expired(&pool).await.expect("sweep failed");
        assert_eq!(swept, 1);

        let count = live_lease_count(&pool, "default").await.expect("count failed");
        assert_eq!(count, 0);
    }
}
