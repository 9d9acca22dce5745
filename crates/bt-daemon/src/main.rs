//! bt-daemon entry point.
//!
//! Thin by design: load config and env, wire up storage/container/event
//! backends, spawn the engine's long-lived tasks under one shared
//! cancellation token, and serve the observability HTTP surface. Everything
//! else lives in `bt-engine`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bt_container::DockerContainerManager;
use bt_daemon::{routes, state::AppState};
use bt_engine::{CronScheduler, Dispatcher, EngineConfig, JobOutcome, OptimizationTracker, WorkerPool};
use bt_events::{Handler as SubscriberHandler, LapinPublisher, SubscriberConfig};
use bt_storage::PgRepository;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let pool = bt_storage::connect_from_env().await.context("connecting to database")?;
    bt_storage::migrate(&pool).await.context("running migrations")?;
    let repo: Arc<dyn bt_storage::Repository> = Arc::new(PgRepository::new(pool));

    let containers: Arc<dyn bt_container::ContainerManager> =
        Arc::new(DockerContainerManager::connect_from_env().context("connecting to docker")?);

    let amqp_url = std::env::var("BT_AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string());
    let exchange = std::env::var("BT_EVENTS_EXCHANGE").unwrap_or_else(|_| "bt.events".to_string());
    let publisher: Arc<dyn bt_events::Publisher> =
        Arc::new(LapinPublisher::connect(amqp_url.clone(), exchange.clone()));

    let config = EngineConfig::from_env();
    let root = CancellationToken::new();

    let (job_tx, job_rx) = mpsc::channel(config.max_concurrent_backtests);
    let (result_tx, mut result_rx) = mpsc::channel::<JobOutcome>(config.max_concurrent_backtests);

    let optimization = Arc::new(OptimizationTracker::new(repo.clone(), publisher.clone()));

    let dispatcher = Arc::new(Dispatcher::new(repo.clone(), publisher.clone(), config.clone()));
    let dispatcher_handle = dispatcher.spawn(job_tx, root.clone());

    let worker_pool = Arc::new(WorkerPool::new(
        repo.clone(),
        containers.clone(),
        publisher.clone(),
        optimization.clone(),
        config.clone(),
    ));
    let mut worker_handles = worker_pool.clone().spawn(job_rx, result_tx, root.clone());
    worker_handles.push(dispatcher_handle);

    let cron_scheduler = Arc::new(CronScheduler::new(repo.clone(), publisher.clone(), config.clone()));
    let cron_handle = cron_scheduler.spawn(root.clone());
    worker_handles.push(cron_handle);

    let audit_handle = spawn_audit_subscriber(amqp_url, exchange, root.clone());
    worker_handles.push(audit_handle);

    tokio::spawn(async move {
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                JobOutcome::Completed { job_id, result_id } => info!(%job_id, %result_id, "job completed"),
                JobOutcome::Failed { job_id, message } => warn!(%job_id, message, "job failed"),
                JobOutcome::Cancelled { job_id } => warn!(%job_id, "job cancelled"),
            }
        }
    });

    let app_state = Arc::new(AppState::new(repo, containers, publisher, root.clone()));
    let app = routes::build_router(app_state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env();
    info!("bt-daemon listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server crashed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    root.cancel();
    worker_pool.shutdown(worker_handles).await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

fn bind_addr_from_env() -> std::net::SocketAddr {
    std::env::var("BT_DAEMON_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 8900)))
}

/// Audit-log consumer: binds the wildcard routing key so every published
/// event is observed and logged. `run_subscriber` runs one connection's
/// worth of consuming and returns when that connection drops, so this is
/// the caller-side retry loop its own doc comment asks for — a fixed
/// backoff between attempts, matching the worker pool's retry convention
/// rather than the publisher's exponential one, since a dropped consumer
/// connection isn't expected to need backing off harder over time.
fn spawn_audit_subscriber(
    amqp_url: String,
    exchange: String,
    root: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const RECONNECT_DELAY: Duration = Duration::from_secs(5);

    tokio::spawn(async move {
        let config = SubscriberConfig {
            amqp_url,
            exchange,
            queue_name: "bt-daemon.audit".to_string(),
            routing_keys: vec!["#".to_string()],
            prefetch: 16,
        };
        let handler: SubscriberHandler = Arc::new(|envelope| {
            Box::pin(async move {
                info!(
                    event_id = %envelope.event_id,
                    routing_key = envelope.routing_key(),
                    source = %envelope.source,
                    "event received"
                );
                Ok(())
            })
        });

        loop {
            tokio::select! {
                _ = root.cancelled() => {
                    warn!("audit subscriber stopping on root cancellation");
                    return;
                }
                result = bt_events::run_subscriber(config.clone(), handler.clone()) => {
                    match result {
                        Ok(()) => warn!("audit subscriber connection closed, reconnecting"),
                        Err(e) => warn!(error = %e, "audit subscriber failed, reconnecting"),
                    }
                }
            }

            tokio::select! {
                _ = root.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    })
}
