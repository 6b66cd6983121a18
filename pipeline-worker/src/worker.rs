use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use health::HealthHandle;
use pipeline_common::domain::{JobType, PipelineJobPayload};
use pipeline_common::external::{Classifier, ObjectStore, SandboxRunner, VerdictSynthesizer};
use pipeline_common::queue::{self, JobStatus};
use pipeline_common::slots;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::handlers::{analysis, trial, verdict};

/// The external collaborators every handler needs. Bundled once per process
/// and shared by reference into whichever handler ends up claiming a job.
pub struct Handlers {
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub sandbox_runner: Arc<dyn SandboxRunner>,
    pub classifier: Arc<dyn Classifier>,
    pub verdict_synthesizer: Arc<dyn VerdictSynthesizer>,
    pub analysis_timeout: StdDuration,
    pub verdict_timeout: StdDuration,
    pub analysis_queue_key: String,
    pub verdict_queue_key: String,
    pub default_max_attempts: i32,
    pub storage_enabled: bool,
    pub retry_delay: ChronoDuration,
}

/// A single-job worker: acquires one concurrency slot for its queue key,
/// claims one job, dispatches it, releases the slot, and is done. The
/// dispatcher spawns one OS process per planned job and sets this struct up
/// once inside it.
pub struct PipelineWorker {
    id: String,
    pool: PgPool,
    queue_key: String,
    poll_interval: StdDuration,
    max_wait: StdDuration,
    lease: ChronoDuration,
    liveness: HealthHandle,
}

pub enum JobOutcome {
    NoJobAvailable,
    Handled { job_id: i64, succeeded: bool },
}

impl PipelineWorker {
    pub fn new(
        name: &str,
        pool: PgPool,
        queue_key: &str,
        poll_interval: StdDuration,
        max_wait: StdDuration,
        lease: ChronoDuration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            id: format!("{name}-{}", std::process::id()),
            pool,
            queue_key: queue_key.to_owned(),
            poll_interval,
            max_wait,
            lease,
            liveness,
        }
    }

    /// Acquire a slot, claim one job, dispatch it, release the slot. Returns
    /// `NoJobAvailable` (not an error) if no slot or no job showed up within
    /// `max_wait` — the dispatcher's own capacity estimate can be stale by
    /// the time this process starts.
    pub async fn run_one_shot(&self, queue_limit: i32, handlers: &Handlers) -> Result<JobOutcome, WorkerError> {
        let deadline = tokio::time::Instant::now() + self.max_wait;

        let slot = loop {
            self.liveness.report_healthy().await;

            if let Some(slot) = slots::acquire(&self.pool, &self.queue_key, queue_limit, &self.id, self.lease).await?
            {
                break slot;
            }

            if tokio::time::Instant::now() >= deadline {
                info!(queue_key = %self.queue_key, "no slot became available before max_wait");
                return Ok(JobOutcome::NoJobAvailable);
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let outcome = self.claim_and_dispatch(deadline, handlers).await;

        if let Err(error) = slots::release(&self.pool, &self.queue_key, slot, &self.id).await {
            warn!(%error, queue_key = %self.queue_key, slot, "failed to release slot");
        }

        outcome
    }

    async fn claim_and_dispatch(
        &self,
        deadline: tokio::time::Instant,
        handlers: &Handlers,
    ) -> Result<JobOutcome, WorkerError> {
        let job = loop {
            self.liveness.report_healthy().await;

            if let Some(job) = queue::claim_one::<PipelineJobPayload>(&self.pool, &self.queue_key).await? {
                break job;
            }

            if tokio::time::Instant::now() >= deadline {
                info!(queue_key = %self.queue_key, "no job became available before max_wait");
                return Ok(JobOutcome::NoJobAvailable);
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let job_id = job.id;
        let payload = job.payload.0;

        let result = match payload.job_type {
            JobType::Trial => {
                trial::handle(
                    &self.pool,
                    payload.trial_id.as_deref(),
                    handlers,
                )
                .await
            }
            JobType::Analysis => {
                analysis::handle(&self.pool, payload.trial_id.as_deref(), handlers).await
            }
            JobType::Verdict => {
                verdict::handle(&self.pool, payload.task_id.as_deref(), handlers).await
            }
        };

        let succeeded = result.is_ok();
        if let Err(ref error) = result {
            error!(%error, job_id, "handler failed");
        }

        let status = if succeeded { JobStatus::Success } else { JobStatus::Failed };
        queue::complete(&self.pool, job_id, status).await?;
        let _ = queue::log(&self.pool, job_id, &self.queue_key, if succeeded { "success" } else { "failed" }).await;

        Ok(JobOutcome::Handled { job_id, succeeded })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use pipeline_common::domain::TrialStatus;
    use pipeline_common::external::{
        Classification, ClassificationResult, Classifier, ClassifierError, HookCallback, SandboxError,
        SandboxOutcome, SandboxRunner, VerdictError, VerdictResult, VerdictSynthesizer,
    };
    use time::Duration as TimeDuration;

    use super::*;

    struct ImmediateSuccessRunner;

    #[async_trait]
    impl SandboxRunner for ImmediateSuccessRunner {
        async fn run_trial(
            &self,
            _task_dir: &Path,
            _agent: &str,
            _model: &str,
            _environment_type: &str,
            _sandbox_config: Option<&serde_json::Value>,
            _trial_id: &str,
            _on_event: HookCallback,
        ) -> Result<SandboxOutcome, SandboxError> {
            Ok(SandboxOutcome {
                reward: Some(1),
                error: None,
                exit_code: Some(0),
                duration_sec: 1.0,
                result_path: None,
                job_dir: std::env::temp_dir().to_string_lossy().into_owned(),
                input_tokens: Some(10),
                cache_tokens: None,
                output_tokens: Some(5),
                cost_usd: Some(0.01),
                phase_timing: None,
                has_trajectory: false,
                verifier_ran: true,
                is_agent_timeout: false,
            })
        }
    }

    struct StubClassifier;

    #[async_trait]
    impl Classifier for StubClassifier {
        async fn classify_trial(
            &self,
            _task_dir: &Path,
            _trial_dir: &Path,
            _timeout: StdDuration,
        ) -> Result<ClassificationResult, ClassifierError> {
            Ok(ClassificationResult {
                classification: Classification::GoodSuccess,
                subtype: "test".to_owned(),
                evidence: String::new(),
                root_cause: String::new(),
                recommendation: String::new(),
                reward: Some(1),
            })
        }
    }

    struct StubVerdictSynthesizer;

    #[async_trait]
    impl VerdictSynthesizer for StubVerdictSynthesizer {
        async fn synthesize(
            &self,
            _classifications: &[(String, ClassificationResult)],
            _trial_metadata: &HashMap<String, String>,
            _timeout: StdDuration,
        ) -> Result<VerdictResult, VerdictError> {
            Ok(VerdictResult {
                is_good: true,
                confidence: 100,
                primary_issue: String::new(),
                recommendations: Vec::new(),
                task_problem_count: 0,
                agent_problem_count: 0,
                success_count: 1,
                harness_error_count: 0,
            })
        }
    }

    fn test_handlers() -> Handlers {
        Handlers {
            object_store: None,
            sandbox_runner: Arc::new(ImmediateSuccessRunner),
            classifier: Arc::new(StubClassifier),
            verdict_synthesizer: Arc::new(StubVerdictSynthesizer),
            analysis_timeout: StdDuration::from_secs(30),
            verdict_timeout: StdDuration::from_secs(30),
            analysis_queue_key: "analysis".to_owned(),
            verdict_queue_key: "verdict".to_owned(),
            default_max_attempts: 6,
            storage_enabled: false,
            retry_delay: ChronoDuration::minutes(60),
        }
    }

    async fn seed_trial(pool: &PgPool, task_id: &str, trial_id: &str, queue_key: &str) {
        sqlx::query("INSERT INTO tasks (id, name, tenant_id, task_path) VALUES ($1, 'task', 'tenant', '/tmp')")
            .bind(task_id)
            .execute(pool)
            .await
            .expect("insert task");

        sqlx::query(
            "INSERT INTO trials (id, task_id, name, agent, model, queue_key, max_attempts) VALUES ($1, $2, 'trial', 'codex', 'claude-3-5-sonnet', $3, 6)",
        )
        .bind(trial_id)
        .bind(task_id)
        .bind(queue_key)
        .execute(pool)
        .await
        .expect("insert trial");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn no_job_returns_no_job_available(pool: PgPool) {
        let liveness = health::HealthRegistry::new("test").register("worker".to_owned(), TimeDuration::seconds(60)).await;
        let worker = PipelineWorker::new(
            "test",
            pool,
            "anthropic/claude-3-5-sonnet",
            StdDuration::from_millis(10),
            StdDuration::from_millis(30),
            ChronoDuration::seconds(60),
            liveness,
        );

        let outcome = worker
            .run_one_shot(1, &test_handlers())
            .await
            .expect("run_one_shot should not error");

        assert!(matches!(outcome, JobOutcome::NoJobAvailable));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn claims_and_succeeds_a_trial_job(pool: PgPool) {
        seed_trial(&pool, "task-1", "task-1-0", "anthropic/claude-3-5-sonnet").await;
        queue::enqueue(&pool, "anthropic/claude-3-5-sonnet", &PipelineJobPayload::trial("task-1-0"), 0)
            .await
            .expect("enqueue trial job");

        let liveness = health::HealthRegistry::new("test").register("worker".to_owned(), TimeDuration::seconds(60)).await;
        let worker = PipelineWorker::new(
            "test",
            pool.clone(),
            "anthropic/claude-3-5-sonnet",
            StdDuration::from_millis(10),
            StdDuration::from_millis(500),
            ChronoDuration::seconds(60),
            liveness,
        );

        let outcome = worker
            .run_one_shot(1, &test_handlers())
            .await
            .expect("run_one_shot should not error");

        match outcome {
            JobOutcome::Handled { succeeded, .. } => assert!(succeeded),
            JobOutcome::NoJobAvailable => panic!("expected the seeded job to be claimed"),
        }

        let status: TrialStatus = sqlx::query_scalar("SELECT status FROM trials WHERE id = 'task-1-0'")
            .fetch_one(&pool)
            .await
            .expect("fetch trial status");
        assert_eq!(status, TrialStatus::Success);
    }
}
