//! Trial handler: claims one trial, runs it through the sandbox, and
//! terminalizes it. Every status write is its own short transaction so the
//! pool connection is released for the (potentially hours-long) sandbox
//! call in between.

use pipeline_common::domain::{PipelineJobPayload, TaskStatus, TrialStatus};
use pipeline_common::external::HookEvent;
use pipeline_common::pipeline::maybe_start_analysis_stage;
use pipeline_common::queue;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::worker::Handlers;

use super::{materialize, scratch_dir_for};

struct ClaimedTrial {
    task_id: String,
    agent: String,
    model: String,
    attempts: i32,
    max_attempts: i32,
    task_path: Option<String>,
    task_s3_key: Option<String>,
    sandbox_config: Option<serde_json::Value>,
    run_analysis: bool,
}

pub async fn handle(pool: &PgPool, trial_id: Option<&str>, handlers: &Handlers) -> Result<(), HandlerError> {
    let trial_id = trial_id.ok_or_else(|| HandlerError::InvalidPayload("trial_id".to_owned()))?;

    let claimed = match mark_running(pool, trial_id).await? {
        Some(claimed) => claimed,
        None => {
            info!(trial_id, "trial already terminal, skipping");
            return Ok(());
        }
    };

    let task_scratch = scratch_dir_for("task", &claimed.task_id);
    let task_dir = materialize(
        handlers,
        claimed.task_s3_key.as_deref(),
        claimed.task_path.as_deref(),
        &task_scratch,
    )
    .await?;

    let pool_for_hook = pool.clone();
    let trial_id_for_hook = trial_id.to_owned();
    let on_event: pipeline_common::external::HookCallback = Box::new(move |event: HookEvent| {
        let pool = pool_for_hook.clone();
        let trial_id = trial_id_for_hook.clone();
        Box::pin(async move {
            if let Err(error) = apply_hook_event(&pool, &trial_id, event).await {
                warn!(%error, trial_id, "failed to record trial lifecycle event");
            }
        })
    });

    let run_result = handlers
        .sandbox_runner
        .run_trial(
            &task_dir,
            &claimed.agent,
            &claimed.model,
            "default",
            claimed.sandbox_config.as_ref(),
            trial_id,
            on_event,
        )
        .await;

    let outcome = match run_result {
        Ok(outcome) => outcome,
        Err(error) => {
            terminalize(pool, trial_id, &claimed, None, Some(error.to_string()), None, handlers).await?;
            return Ok(());
        }
    };

    // Upload artifacts whenever storage is enabled for this worker, or the
    // task itself was materialized from object storage in the first place
    // (that prefix's presence means downstream readers expect one).
    let should_upload = handlers.storage_enabled || claimed.task_s3_key.is_some();
    if should_upload {
        if let Some(store) = handlers.object_store.as_ref() {
            let prefix = format!("tasks/{}/trials/{}/", claimed.task_id, trial_id);
            if let Err(error) = store
                .upload_directory(&prefix, std::path::Path::new(&outcome.job_dir))
                .await
            {
                warn!(%error, trial_id, "failed to upload trial artifacts");
            } else {
                sqlx::query("UPDATE trials SET artifact_prefix = $1 WHERE id = $2")
                    .bind(&prefix)
                    .bind(trial_id)
                    .execute(pool)
                    .await?;
            }
        }
    }

    terminalize(
        pool,
        trial_id,
        &claimed,
        outcome.reward,
        outcome.error,
        Some(&outcome),
        handlers,
    )
    .await
}

async fn mark_running(pool: &PgPool, trial_id: &str) -> Result<Option<ClaimedTrial>, HandlerError> {
    let mut tx = pool.begin().await?;

    let row: Option<(
        TrialStatus,
        String,
        String,
        String,
        i32,
        i32,
        Option<String>,
        Option<serde_json::Value>,
        Option<String>,
        Option<String>,
    )> = sqlx::query_as(
        r#"
        SELECT t.status, t.task_id, t.agent, t.model, t.attempts, t.max_attempts,
               t.idempotency_key, t.sandbox_config, k.task_path, k.task_s3_key
        FROM trials t
        JOIN tasks k ON k.id = t.task_id
        WHERE t.id = $1
        FOR UPDATE OF t
        "#,
    )
    .bind(trial_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((status, task_id, agent, model, attempts, max_attempts, idempotency_key, sandbox_config, task_path, task_s3_key)) = row
    else {
        return Ok(None);
    };

    if status.is_terminal() {
        return Ok(None);
    }

    let idempotency_key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
    let next_attempt = attempts + 1;

    sqlx::query(
        r#"
        UPDATE trials
        SET status = 'running', started_at = COALESCE(started_at, NOW()),
            harbor_stage = 'starting', attempts = $2, idempotency_key = $3
        WHERE id = $1
        "#,
    )
    .bind(trial_id)
    .bind(next_attempt)
    .bind(&idempotency_key)
    .execute(&mut *tx)
    .await?;

    let task_status: Option<TaskStatus> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(&task_id)
        .fetch_optional(&mut *tx)
        .await?;

    let run_analysis: bool = sqlx::query_scalar("SELECT run_analysis FROM tasks WHERE id = $1")
        .bind(&task_id)
        .fetch_one(&mut *tx)
        .await?;

    if task_status == Some(TaskStatus::Pending) {
        sqlx::query("UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, NOW()) WHERE id = $1")
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    Ok(Some(ClaimedTrial {
        task_id,
        agent,
        model,
        attempts: next_attempt,
        max_attempts,
        task_path,
        task_s3_key,
        sandbox_config,
        run_analysis,
    }))
}

async fn apply_hook_event(pool: &PgPool, trial_id: &str, event: HookEvent) -> Result<(), sqlx::Error> {
    let stage = match &event {
        HookEvent::TrialStart => "starting",
        HookEvent::EnvironmentStart => "environment_setup",
        HookEvent::AgentStart => "agent_running",
        HookEvent::VerificationStart => "verification",
        HookEvent::End { .. } => "completed",
        HookEvent::Cancel { .. } => "cancelled",
    };

    sqlx::query("UPDATE trials SET harbor_stage = $2 WHERE id = $1")
        .bind(trial_id)
        .bind(stage)
        .execute(pool)
        .await?;

    // The `end` event is authoritative: pre-terminalize here so a worker
    // killed between this write and the handler's own final write still
    // leaves the trial in a terminal state rather than stuck `running`.
    if let HookEvent::End { reward, error } = event {
        if let Some(reward) = reward {
            sqlx::query("UPDATE trials SET status = 'success', reward = $2, finished_at = NOW() WHERE id = $1")
                .bind(trial_id)
                .bind(reward)
                .execute(pool)
                .await?;
        } else if let Some(error) = error {
            sqlx::query("UPDATE trials SET status = 'failed', error = $2, finished_at = NOW() WHERE id = $1")
                .bind(trial_id)
                .bind(error)
                .execute(pool)
                .await?;
        }
    } else if let HookEvent::Cancel { reason } = event {
        sqlx::query("UPDATE trials SET status = 'failed', error = $2, finished_at = NOW() WHERE id = $1")
            .bind(trial_id)
            .bind(reason)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// An agent-execution timeout with the verifier having run is scored as a
/// normal failure (reward 0), not an infrastructure error worth retrying.
fn is_agent_timeout_as_failure(outcome: &pipeline_common::external::SandboxOutcome) -> bool {
    outcome.is_agent_timeout && outcome.verifier_ran
}

#[allow(clippy::too_many_arguments)]
async fn terminalize(
    pool: &PgPool,
    trial_id: &str,
    claimed: &ClaimedTrial,
    mut reward: Option<i32>,
    error: Option<String>,
    outcome: Option<&pipeline_common::external::SandboxOutcome>,
    handlers: &Handlers,
) -> Result<(), HandlerError> {
    if reward.is_none() {
        if let Some(outcome) = outcome {
            if is_agent_timeout_as_failure(outcome) {
                reward = Some(0);
            }
        }
    }

    let mut tx = pool.begin().await?;

    if let Some(reward) = reward {
        sqlx::query(
            r#"
            UPDATE trials
            SET status = 'success', reward = $2, error = NULL, finished_at = NOW(),
                input_tokens = $3, cache_tokens = $4, output_tokens = $5, cost_usd = $6,
                phase_timing = $7, has_trajectory = $8
            WHERE id = $1
            "#,
        )
        .bind(trial_id)
        .bind(reward)
        .bind(outcome.and_then(|o| o.input_tokens))
        .bind(outcome.and_then(|o| o.cache_tokens))
        .bind(outcome.and_then(|o| o.output_tokens))
        .bind(outcome.and_then(|o| o.cost_usd))
        .bind(
            outcome
                .and_then(|o| o.phase_timing.as_ref())
                .and_then(|p| serde_json::to_value(p).ok()),
        )
        .bind(outcome.map(|o| o.has_trajectory).unwrap_or(false))
        .execute(&mut *tx)
        .await?;
    } else if claimed.attempts < claimed.max_attempts {
        sqlx::query("UPDATE trials SET status = 'retrying', error = $2 WHERE id = $1")
            .bind(trial_id)
            .bind(&error)
            .execute(&mut *tx)
            .await?;

        let payload = PipelineJobPayload::trial(trial_id);
        queue::enqueue_delayed(
            &mut *tx,
            &claimed.queue_key(),
            &payload,
            0,
            handlers.retry_delay,
        )
        .await?;

        tx.commit().await?;
        info!(trial_id, attempts = claimed.attempts, "trial scheduled for retry");
        return Ok(());
    } else {
        warn!(
            error = %HandlerError::MaxAttemptsReached(trial_id.to_owned()),
            trial_id,
            attempts = claimed.attempts,
            "trial exhausted its retry budget"
        );
        sqlx::query("UPDATE trials SET status = 'failed', error = $2, finished_at = NOW() WHERE id = $1")
            .bind(trial_id)
            .bind(&error)
            .execute(&mut *tx)
            .await?;
    }

    if claimed.run_analysis {
        let already_queued: Option<String> =
            sqlx::query_scalar("SELECT analysis_status::text FROM trials WHERE id = $1")
                .bind(trial_id)
                .fetch_optional(&mut *tx)
                .await?
                .flatten();

        if already_queued.is_none() {
            sqlx::query("UPDATE trials SET analysis_status = 'queued' WHERE id = $1")
                .bind(trial_id)
                .execute(&mut *tx)
                .await?;

            let payload = PipelineJobPayload::analysis(trial_id);
            queue::enqueue(&mut *tx, &handlers.analysis_queue_key, &payload, 0).await?;
        }
    }

    tx.commit().await?;

    maybe_start_analysis_stage(pool, trial_id, &handlers.verdict_queue_key).await?;

    Ok(())
}

impl ClaimedTrial {
    /// The queue key a retried attempt of this trial belongs on. Trials are
    /// always retried on their own queue key, never rerouted.
    fn queue_key(&self) -> String {
        pipeline_common::queue_key::trial_queue_key(&self.agent, &self.model)
    }
}
