//! Domain types shared by the worker and the dispatcher: the row shapes the
//! pipeline reads and writes, and the queue payloads that move between
//! stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Pipeline-level status of a task, advanced only from [`crate::pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "task_status")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Analyzing,
    VerdictPending,
    Completed,
    Failed,
}

/// Execution status of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "trial_status")]
#[sqlx(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Queued,
    Running,
    Retrying,
    Success,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrialStatus::Success | TrialStatus::Failed)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TrialStatus::Pending | TrialStatus::Queued | TrialStatus::Running | TrialStatus::Retrying
        )
    }
}

/// Status of the analysis sub-stage of a trial; `None` on the row means
/// analysis was never requested for this trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "analysis_status")]
#[sqlx(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
}

impl AnalysisStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            AnalysisStatus::Pending | AnalysisStatus::Queued | AnalysisStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AnalysisStatus::Success | AnalysisStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "verdict_status")]
#[sqlx(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, FromRow)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub experiment_id: Option<String>,
    pub priority: String,
    pub status: TaskStatus,
    pub run_analysis: bool,
    pub task_path: Option<String>,
    pub task_s3_key: Option<String>,
    pub verdict: Option<serde_json::Value>,
    pub verdict_status: Option<VerdictStatus>,
    pub verdict_error: Option<String>,
    pub tags: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Trial {
    pub id: String,
    pub task_id: String,
    pub name: String,
    pub agent: String,
    pub model: String,
    pub queue_key: String,
    pub status: TrialStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub harbor_stage: Option<String>,
    pub idempotency_key: Option<String>,
    pub reward: Option<i32>,
    pub error: Option<String>,
    pub artifact_prefix: Option<String>,
    pub sandbox_config: Option<serde_json::Value>,
    pub input_tokens: Option<i32>,
    pub cache_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub cost_usd: Option<f64>,
    pub phase_timing: Option<serde_json::Value>,
    pub has_trajectory: bool,
    pub analysis_status: Option<AnalysisStatus>,
    pub analysis_result: Option<serde_json::Value>,
    pub analysis_error: Option<String>,
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub analysis_finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The `job_type` discriminant carried in every `jobq.payload`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Trial,
    Analysis,
    Verdict,
}

/// Payload shape enqueued for every pipeline job. `job_type` decides which
/// handler the worker dispatches to; the remaining fields are only
/// meaningful for the matching job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJobPayload {
    pub job_type: JobType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl PipelineJobPayload {
    pub fn trial(trial_id: impl Into<String>) -> Self {
        Self {
            job_type: JobType::Trial,
            trial_id: Some(trial_id.into()),
            task_id: None,
        }
    }

    pub fn analysis(trial_id: impl Into<String>) -> Self {
        Self {
            job_type: JobType::Analysis,
            trial_id: Some(trial_id.into()),
            task_id: None,
        }
    }

    pub fn verdict(task_id: impl Into<String>) -> Self {
        Self {
            job_type: JobType::Verdict,
            trial_id: None,
            task_id: Some(task_id.into()),
        }
    }
}
