use pipeline_common::external::{ClassifierError, ObjectStoreError, SandboxError, VerdictError};
use pipeline_common::queue::QueueError;
use pipeline_common::slots::SlotError;
use thiserror::Error;

/// Errors a handler can raise. `InvalidPayload` is non-recoverable;
/// everything else is surfaced to the worker shell, which decides whether
/// the underlying job row should be marked `failed` (and, separately,
/// whether the trial/task row itself should retry).
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("pipeline transition error: {0}")]
    Pipeline(#[from] pipeline_common::pipeline::PipelineError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("verdict synthesis error: {0}")]
    Verdict(#[from] VerdictError),
    #[error("job payload missing required field: {0}")]
    InvalidPayload(String),
    #[error("{0} has reached max attempts and cannot be retried further")]
    MaxAttemptsReached(String),
}

/// Top-level worker-shell errors: everything outside of handler execution
/// (connecting, acquiring a slot, claiming a job).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("slot error: {0}")]
    Slot(#[from] SlotError),
}
