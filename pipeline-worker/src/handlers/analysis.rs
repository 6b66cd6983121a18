//! Analysis handler: classifies one finished trial's artifacts, grounded on
//! the trial/task directory pair the classifier needs to compare agent
//! output against expected behaviour.

use pipeline_common::domain::AnalysisStatus;
use pipeline_common::pipeline::maybe_start_verdict_stage;
use sqlx::PgPool;
use tracing::info;

use crate::error::HandlerError;
use crate::worker::Handlers;

use super::{materialize, scratch_dir_for};

pub async fn handle(pool: &PgPool, trial_id: Option<&str>, handlers: &Handlers) -> Result<(), HandlerError> {
    let trial_id = trial_id.ok_or_else(|| HandlerError::InvalidPayload("trial_id".to_owned()))?;

    let row: Option<(Option<AnalysisStatus>, String, Option<String>, Option<String>, Option<String>)> =
        sqlx::query_as(
            "SELECT analysis_status, task_id, artifact_prefix, task_path, task_s3_key FROM trials t JOIN tasks k ON k.id = t.task_id WHERE t.id = $1",
        )
        .bind(trial_id)
        .fetch_optional(pool)
        .await?;

    let Some((analysis_status, task_id, artifact_prefix, task_path, task_s3_key)) = row else {
        return Err(HandlerError::InvalidPayload(format!("trial {trial_id} not found")));
    };

    if matches!(analysis_status, Some(AnalysisStatus::Success) | Some(AnalysisStatus::Failed)) {
        info!(trial_id, "analysis already terminal, skipping");
        return Ok(());
    }

    sqlx::query(
        "UPDATE trials SET analysis_status = 'running', analysis_started_at = COALESCE(analysis_started_at, NOW()) WHERE id = $1",
    )
    .bind(trial_id)
    .execute(pool)
    .await?;

    let task_scratch = scratch_dir_for("task", &task_id);
    let task_dir = materialize(handlers, task_s3_key.as_deref(), task_path.as_deref(), &task_scratch).await?;

    let trial_scratch = scratch_dir_for("trial", trial_id);
    let trial_dir = materialize(handlers, artifact_prefix.as_deref(), None, &trial_scratch)
        .await
        .unwrap_or(trial_scratch);

    let result = handlers
        .classifier
        .classify_trial(&task_dir, &trial_dir, handlers.analysis_timeout)
        .await;

    match result {
        Ok(classification) => {
            sqlx::query(
                r#"
                UPDATE trials
                SET analysis_status = 'success', analysis_result = $2, analysis_error = NULL,
                    analysis_finished_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(trial_id)
            .bind(serde_json::to_value(&classification).ok())
            .execute(pool)
            .await?;
        }
        Err(error) => {
            sqlx::query(
                "UPDATE trials SET analysis_status = 'failed', analysis_error = $2, analysis_finished_at = NOW() WHERE id = $1",
            )
            .bind(trial_id)
            .bind(error.to_string())
            .execute(pool)
            .await?;
        }
    }

    maybe_start_verdict_stage(pool, trial_id, &handlers.verdict_queue_key).await?;

    Ok(())
}
