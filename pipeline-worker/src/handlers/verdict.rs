//! Verdict handler: synthesizes a single task-level verdict from its trials'
//! classifications. Runs once per task, after every trial (and, if
//! requested, every analysis) has terminalized.

use std::collections::HashMap;

use pipeline_common::domain::TaskStatus;
use pipeline_common::external::ClassificationResult;
use sqlx::PgPool;
use tracing::info;

use crate::error::HandlerError;
use crate::worker::Handlers;

pub async fn handle(pool: &PgPool, task_id: Option<&str>, handlers: &Handlers) -> Result<(), HandlerError> {
    let task_id = task_id.ok_or_else(|| HandlerError::InvalidPayload("task_id".to_owned()))?;

    let status: Option<TaskStatus> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    match status {
        None => return Err(HandlerError::InvalidPayload(format!("task {task_id} not found"))),
        Some(TaskStatus::Completed) | Some(TaskStatus::Failed) => {
            info!(task_id, "task already terminal, skipping verdict");
            return Ok(());
        }
        _ => {}
    }

    sqlx::query("UPDATE tasks SET verdict_status = 'running' WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await?;

    let rows: Vec<(String, String, Option<serde_json::Value>)> = sqlx::query_as(
        "SELECT id, name, analysis_result FROM trials WHERE task_id = $1 AND analysis_result IS NOT NULL",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;

    let mut classifications = Vec::with_capacity(rows.len());
    let mut trial_metadata = HashMap::with_capacity(rows.len());
    for (trial_id, name, result) in rows {
        if let Some(result) = result.and_then(|v| serde_json::from_value::<ClassificationResult>(v).ok()) {
            trial_metadata.insert(trial_id.clone(), name);
            classifications.push((trial_id, result));
        }
    }

    let synthesis = handlers
        .verdict_synthesizer
        .synthesize(&classifications, &trial_metadata, handlers.verdict_timeout)
        .await;

    match synthesis {
        Ok(verdict) => {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'completed', verdict_status = 'success', verdict = $2, verdict_error = NULL,
                    finished_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(serde_json::to_value(&verdict).ok())
            .execute(pool)
            .await?;
        }
        Err(error) => {
            sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'completed', verdict_status = 'failed', verdict_error = $2, finished_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(task_id)
            .bind(error.to_string())
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}
