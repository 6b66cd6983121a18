//! Stand-ins for the collaborators whose concrete implementation (the
//! actual S3 client, the actual sandbox orchestrator, the actual
//! LLM-backed classifier and verdict prompts) is out of scope here: the
//! core only needs to drive them through the traits in
//! `pipeline_common::external`. A deployment wires real backends in at
//! `main` in place of these.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_common::external::{
    Classification, ClassificationResult, Classifier, ClassifierError, HookCallback, ObjectStore,
    ObjectStoreError, SandboxError, SandboxOutcome, SandboxRunner, VerdictError, VerdictResult,
    VerdictSynthesizer,
};

pub struct UnconfiguredObjectStore;

#[async_trait]
impl ObjectStore for UnconfiguredObjectStore {
    async fn upload_directory(&self, prefix: &str, _local_dir: &Path) -> Result<(), ObjectStoreError> {
        Err(ObjectStoreError::Request(format!("no object store backend configured for {prefix}")))
    }

    async fn download_prefix(&self, prefix: &str, _local_dir: &Path) -> Result<(), ObjectStoreError> {
        Err(ObjectStoreError::NotFound(prefix.to_owned()))
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(Vec::new())
    }

    async fn download_text(&self, key: &str) -> Result<String, ObjectStoreError> {
        Err(ObjectStoreError::NotFound(key.to_owned()))
    }

    async fn presign(&self, key: &str, _ttl_seconds: u64) -> Result<String, ObjectStoreError> {
        Err(ObjectStoreError::NotFound(key.to_owned()))
    }
}

pub struct UnconfiguredSandboxRunner;

#[async_trait]
impl SandboxRunner for UnconfiguredSandboxRunner {
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
        Err(SandboxError::Failed("no sandbox backend configured".to_owned()))
    }
}

pub struct UnconfiguredClassifier;

#[async_trait]
impl Classifier for UnconfiguredClassifier {
    async fn classify_trial(
        &self,
        _task_dir: &Path,
        _trial_dir: &Path,
        _timeout: Duration,
    ) -> Result<ClassificationResult, ClassifierError> {
        Ok(ClassificationResult {
            classification: Classification::HarnessError,
            subtype: "unconfigured".to_owned(),
            evidence: String::new(),
            root_cause: "no classifier backend configured".to_owned(),
            recommendation: String::new(),
            reward: None,
        })
    }
}

pub struct UnconfiguredVerdictSynthesizer;

#[async_trait]
impl VerdictSynthesizer for UnconfiguredVerdictSynthesizer {
    async fn synthesize(
        &self,
        classifications: &[(String, ClassificationResult)],
        _trial_metadata: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<VerdictResult, VerdictError> {
        let harness_error_count = classifications
            .iter()
            .filter(|(_, c)| c.classification == Classification::HarnessError)
            .count() as i32;

        Ok(VerdictResult {
            is_good: false,
            confidence: 0,
            primary_issue: "no verdict synthesizer backend configured".to_owned(),
            recommendations: Vec::new(),
            task_problem_count: 0,
            agent_problem_count: 0,
            success_count: 0,
            harness_error_count,
        })
    }
}
