//! Claims and runs exactly one job, then exits. The dispatcher spawns one
//! process per planned job; there is no internal polling loop beyond the
//! short `max_wait` window that absorbs the dispatcher's capacity estimate
//! going stale between planning and spawn.
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::routing::get;
use axum::Router;
use chrono::Duration as ChronoDuration;
use envconfig::Envconfig;
use std::future::ready;

use health::HealthRegistry;
use pipeline_common::metrics::{serve, setup_metrics_router};

use pipeline_worker::backends::{
    UnconfiguredClassifier, UnconfiguredObjectStore, UnconfiguredSandboxRunner, UnconfiguredVerdictSynthesizer,
};
use pipeline_worker::config::Config;
use pipeline_worker::error::WorkerError;
use pipeline_worker::worker::{Handlers, JobOutcome, PipelineWorker};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(config.max_wait.0.as_secs() as i64 + 30))
        .await;

    let pool = pipeline_common::queue::connect(
        &config.database_url,
        config.min_pg_connections,
        config.max_pg_connections,
    )
    .await
    .expect("failed to connect to database");

    let retry_delay = ChronoDuration::minutes(config.retry_timer_minutes as i64);

    let handlers = Handlers {
        object_store: if config.storage_enabled {
            Some(Arc::new(UnconfiguredObjectStore) as Arc<_>)
        } else {
            None
        },
        sandbox_runner: Arc::new(UnconfiguredSandboxRunner),
        classifier: Arc::new(UnconfiguredClassifier),
        verdict_synthesizer: Arc::new(UnconfiguredVerdictSynthesizer),
        analysis_timeout: StdDuration::from_secs(config.analysis_timeout_seconds),
        verdict_timeout: StdDuration::from_secs(config.verdict_timeout_seconds),
        analysis_queue_key: config.analysis_queue_key.as_str().to_owned(),
        verdict_queue_key: config.verdict_queue_key.as_str().to_owned(),
        default_max_attempts: config.default_max_attempts,
        storage_enabled: config.storage_enabled,
        retry_delay,
    };

    let worker = PipelineWorker::new(
        &config.worker_name,
        pool,
        config.queue_key.as_str(),
        config.poll_interval.0,
        config.max_wait.0,
        ChronoDuration::seconds(config.lease_seconds as i64),
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    let metrics_server = tokio::task::spawn(async move {
        serve(router, &bind).await.expect("failed to start serving metrics");
    });

    match worker.run_one_shot(config.concurrency_limit(), &handlers).await? {
        JobOutcome::NoJobAvailable => tracing::info!("no job available before max_wait, exiting"),
        JobOutcome::Handled { job_id, succeeded } => {
            tracing::info!(job_id, succeeded, "job handled");
        }
    }

    metrics_server.abort();
    Ok(())
}

pub async fn index() -> &'static str {
    "pipeline worker"
}
