//! Race-free fan-in points: advancing a task's pipeline status once all of
//! its trials (or all of its analyses) have terminalized. Both functions
//! take `SELECT ... FOR UPDATE` on the task row as their serialization
//! point, so of N concurrent callers racing to close out the same task,
//! exactly one proceeds past the lock and the rest observe the
//! already-advanced status and no-op.

use sqlx::PgPool;
use thiserror::Error;

use crate::domain::{PipelineJobPayload, TaskStatus};
use crate::queue::{self, QueueError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("trial {0} has no task_id")]
    OrphanTrial(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Called by the trial handler after it terminalizes a trial. Returns
/// `true` if this call was the one that advanced the task.
pub async fn maybe_start_analysis_stage(
    pool: &PgPool,
    trial_id: &str,
    verdict_queue_key: &str,
) -> PipelineResult<bool> {
    let mut tx = pool.begin().await?;

    let task_id: Option<String> = sqlx::query_scalar("SELECT task_id FROM trials WHERE id = $1")
        .bind(trial_id)
        .fetch_optional(&mut *tx)
        .await?;
    let task_id = task_id.ok_or_else(|| PipelineError::OrphanTrial(trial_id.to_owned()))?;

    let status: Option<(TaskStatus, bool)> = sqlx::query_as(
        "SELECT status, run_analysis FROM tasks WHERE id = $1 FOR UPDATE",
    )
    .bind(&task_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((status, run_analysis)) = status else {
        return Ok(false);
    };

    if !matches!(status, TaskStatus::Pending | TaskStatus::Running) {
        return Ok(false);
    }

    let in_flight_trials: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM trials WHERE task_id = $1 AND status IN ('pending', 'queued', 'running', 'retrying')",
    )
    .bind(&task_id)
    .fetch_one(&mut *tx)
    .await?;

    if in_flight_trials > 0 {
        return Ok(false);
    }

    if run_analysis {
        sqlx::query("UPDATE tasks SET status = 'analyzing' WHERE id = $1")
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;

        let unfinished_analyses: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trials WHERE task_id = $1 AND (analysis_status IS NULL OR analysis_status IN ('pending', 'queued', 'running'))",
        )
        .bind(&task_id)
        .fetch_one(&mut *tx)
        .await?;

        if unfinished_analyses == 0 {
            advance_to_verdict_pending(&mut tx, &task_id, verdict_queue_key).await?;
        }
    } else {
        sqlx::query("UPDATE tasks SET status = 'completed', finished_at = NOW() WHERE id = $1")
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Called by the analysis handler after it terminalizes a trial's analysis.
pub async fn maybe_start_verdict_stage(
    pool: &PgPool,
    trial_id: &str,
    verdict_queue_key: &str,
) -> PipelineResult<bool> {
    let mut tx = pool.begin().await?;

    let task_id: Option<String> = sqlx::query_scalar("SELECT task_id FROM trials WHERE id = $1")
        .bind(trial_id)
        .fetch_optional(&mut *tx)
        .await?;
    let task_id = task_id.ok_or_else(|| PipelineError::OrphanTrial(trial_id.to_owned()))?;

    let status: Option<TaskStatus> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(&task_id)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(status) = status else {
        return Ok(false);
    };

    if status != TaskStatus::Analyzing {
        return Ok(false);
    }

    let unfinished_analyses: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM trials WHERE task_id = $1 AND analysis_status IN ('pending', 'queued', 'running')",
    )
    .bind(&task_id)
    .fetch_one(&mut *tx)
    .await?;

    if unfinished_analyses > 0 {
        return Ok(false);
    }

    advance_to_verdict_pending(&mut tx, &task_id, verdict_queue_key).await?;
    tx.commit().await?;
    Ok(true)
}

async fn advance_to_verdict_pending(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    task_id: &str,
    verdict_queue_key: &str,
) -> PipelineResult<()> {
    sqlx::query(
        "UPDATE tasks SET status = 'verdict_pending', verdict_status = 'queued' WHERE id = $1",
    )
    .bind(task_id)
    .execute(&mut **tx)
    .await?;

    let payload = PipelineJobPayload::verdict(task_id);
    queue::enqueue(&mut **tx, verdict_queue_key, &payload, 0).await?;

    Ok(())
}
