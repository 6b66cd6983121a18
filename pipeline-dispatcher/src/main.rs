//! Periodically plans and spawns one-shot `pipeline-worker` processes: sweep
//! expired slot leases, discover which queue keys have pending work, size a
//! spawn plan against each queue's concurrency limit, and launch one worker
//! process per planned slot. Runs its health/metrics router alongside the
//! planning loop the same way the rest of this codebase's background
//! services do.
use std::process::Stdio;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use health::{HealthHandle, HealthRegistry};
use std::future::ready;
use tokio::process::Command;

use pipeline_common::metrics::setup_metrics_router;
use pipeline_dispatcher::config::Config;
use pipeline_dispatcher::planner::{build_spawn_plan, discover_active_queue_keys, get_queue_counts};

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn dispatch_loop(pool: sqlx::PgPool, config: Config, liveness: HealthHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

    loop {
        interval.tick().await;
        liveness.report_healthy().await;

        if let Err(error) = pipeline_common::slots::sweep_expired(&pool).await {
            tracing::error!(%error, "failed to sweep expired slot leases");
            continue;
        }

        let queue_keys = match discover_active_queue_keys(&pool, &config.known_queue_keys()).await {
            Ok(keys) => keys,
            Err(error) => {
                tracing::error!(%error, "failed to discover active queue keys");
                continue;
            }
        };

        let queue_counts = match get_queue_counts(&pool, &queue_keys).await {
            Ok(counts) => counts,
            Err(error) => {
                tracing::error!(%error, "failed to fetch queue counts");
                continue;
            }
        };

        let plan = build_spawn_plan(
            &queue_counts,
            |key| config.concurrency_limit(key),
            config.max_spawns_per_cycle,
        );

        for queue_key in plan {
            spawn_worker(&config, &queue_key);
        }
    }
}

fn spawn_worker(config: &Config, queue_key: &str) {
    let mut command = Command::new(&config.worker_binary_path);
    command
        .env("QUEUE_KEY", queue_key)
        .env("DATABASE_URL", &config.database_url)
        .env("DEFAULT_QUEUE_CONCURRENCY", config.default_queue_concurrency.to_string())
        .env("QUEUE_CONCURRENCY_OVERRIDES", config.queue_concurrency_overrides.to_env_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    match command.spawn() {
        Ok(mut child) => {
            tracing::info!(queue_key, "spawned worker");
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => {}
                    Ok(status) => tracing::warn!(%status, "worker exited with non-zero status"),
                    Err(error) => tracing::error!(%error, "failed to wait on worker process"),
                }
            });
        }
        Err(error) => tracing::error!(%error, queue_key, "failed to spawn worker"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = pipeline_common::queue::connect(&config.database_url, config.min_pg_connections, config.max_pg_connections)
        .await
        .expect("failed to connect to database");

    let liveness = HealthRegistry::new("liveness");
    let dispatch_liveness = liveness
        .register("dispatch_loop".to_string(), time::Duration::seconds(config.poll_interval_secs as i64 * 3))
        .await;

    let bind = config.bind();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let http_server = Box::pin(listen(router, bind));

    let loop_fut = Box::pin(dispatch_loop(pool, config, dispatch_liveness));

    match select(http_server, loop_fut).await {
        Either::Left((listen_result, _)) => {
            if let Err(error) = listen_result {
                tracing::error!(%error, "failed to start pipeline-dispatcher http server");
            }
        }
        Either::Right((_, _)) => {
            tracing::error!("pipeline-dispatcher planning loop exited");
        }
    }
}

pub async fn index() -> &'static str {
    "pipeline dispatcher"
}
