//! Trait boundaries for the collaborators the pipeline core treats as
//! opaque: object storage, the sandbox runner, and the two LLM-backed
//! synthesis steps. None of these are implemented here — the core only
//! needs to call them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object store request failed: {0}")]
    Request(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

/// The subset of an S3-compatible API the pipeline consumes. Concrete
/// backends (real S3, local filesystem stand-ins for tests) implement this.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload_directory(&self, prefix: &str, local_dir: &Path) -> Result<(), ObjectStoreError>;
    async fn download_prefix(&self, prefix: &str, local_dir: &Path) -> Result<(), ObjectStoreError>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
    async fn download_text(&self, key: &str) -> Result<String, ObjectStoreError>;
    async fn presign(&self, key: &str, ttl_seconds: u64) -> Result<String, ObjectStoreError>;
}

/// Lifecycle events the sandbox runner emits while a trial executes. `End`
/// is authoritative: its fields, if present, pre-terminalize the trial
/// before the runner call itself returns, guarding against a worker getting
/// killed between the event and the final write.
#[derive(Debug, Clone)]
pub enum HookEvent {
    TrialStart,
    EnvironmentStart,
    AgentStart,
    VerificationStart,
    End {
        reward: Option<i32>,
        error: Option<String>,
    },
    Cancel {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub environment_setup_sec: Option<f64>,
    pub agent_sec: Option<f64>,
    pub verification_sec: Option<f64>,
}

/// What the sandbox runner hands back once a trial attempt finishes (or
/// fails to start).
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub reward: Option<i32>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_sec: f64,
    pub result_path: Option<String>,
    pub job_dir: String,
    pub input_tokens: Option<i32>,
    pub cache_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub cost_usd: Option<f64>,
    pub phase_timing: Option<PhaseTiming>,
    pub has_trajectory: bool,
    pub verifier_ran: bool,
    pub is_agent_timeout: bool,
}

pub type HookCallback = Box<dyn Fn(HookEvent) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox run failed: {0}")]
    Failed(String),
    #[error("sandbox run cancelled")]
    Cancelled,
}

/// Runs one trial attempt inside a sandboxed environment. Implementations
/// own the actual container/VM lifecycle; the core only drives it through
/// this call and the hook callback it passes in.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn run_trial(
        &self,
        task_dir: &Path,
        agent: &str,
        model: &str,
        environment_type: &str,
        sandbox_config: Option<&serde_json::Value>,
        trial_id: &str,
        on_event: HookCallback,
    ) -> Result<SandboxOutcome, SandboxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    GoodSuccess,
    GoodFailure,
    BadSuccess,
    BadFailure,
    HarnessError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub subtype: String,
    pub evidence: String,
    pub root_cause: String,
    pub recommendation: String,
    pub reward: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier call failed: {0}")]
    Failed(String),
    #[error("classifier call timed out")]
    Timeout,
}

/// Classifies one finished trial's artifacts into a [`ClassificationResult`].
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_trial(
        &self,
        task_dir: &Path,
        trial_dir: &Path,
        timeout: std::time::Duration,
    ) -> Result<ClassificationResult, ClassifierError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResult {
    pub is_good: bool,
    pub confidence: i32,
    pub primary_issue: String,
    pub recommendations: Vec<String>,
    pub task_problem_count: i32,
    pub agent_problem_count: i32,
    pub success_count: i32,
    pub harness_error_count: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum VerdictError {
    #[error("verdict synthesis failed: {0}")]
    Failed(String),
    #[error("verdict synthesis timed out")]
    Timeout,
}

/// Aggregates the per-trial classifications for a task into a single
/// task-level verdict.
#[async_trait]
pub trait VerdictSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        classifications: &[(String, ClassificationResult)],
        trial_metadata: &HashMap<String, String>,
        timeout: std::time::Duration,
    ) -> Result<VerdictResult, VerdictError>;
}
