//! In-process scenario tests for bt-daemon's HTTP surface.
//!
//! These spin up the Axum router **without** binding a TCP socket and drive
//! it via `tower::ServiceExt::oneshot` — no network I/O required.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use bt_container::{ContainerManager, FakeContainerManager};
use bt_core::{
    BacktestJob, BacktestResult, IterationApproval, JobStatus, OptimizationIteration,
    OptimizationRun, OptimizationStatus, ScoutRun, ScoutRunStatus, ScoutSchedule, Strategy,
};
use bt_daemon::{routes, state::AppState};
use bt_events::FakePublisher;
use bt_storage::{JobFilter, QueueStats, RepoError, Repository, ResultFilter};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

/// Returns a fixed `QueueStats` snapshot; every other method is unused by
/// the observability-only routes this crate exposes and is left
/// unimplemented rather than faked in depth.
struct StubRepository {
    stats: QueueStats,
}

#[async_trait]
impl Repository for StubRepository {
    async fn create_strategy(&self, _strategy: &Strategy) -> Result<(), RepoError> {
        unimplemented!("not exercised by bt-daemon's routes")
    }
    async fn get_strategy(&self, _id: Uuid) -> Result<Strategy, RepoError> {
        unimplemented!()
    }
    async fn get_strategy_by_hash(&self, _code_hash: &str) -> Result<Option<Strategy>, RepoError> {
        unimplemented!()
    }
    async fn delete_strategy(&self, _id: Uuid) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn create_job(&self, _job: &BacktestJob) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn create_jobs_batch(&self, _jobs: &[BacktestJob]) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn get_job(&self, _id: Uuid) -> Result<BacktestJob, RepoError> {
        unimplemented!()
    }
    async fn query_jobs(&self, _filter: &JobFilter) -> Result<Vec<BacktestJob>, RepoError> {
        unimplemented!()
    }
    async fn get_pending_jobs(&self, _limit: i64) -> Result<Vec<BacktestJob>, RepoError> {
        unimplemented!()
    }
    async fn mark_running(&self, _id: Uuid, _expected_prev_status: JobStatus, _now: DateTime<Utc>) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn mark_completed(&self, _id: Uuid, _now: DateTime<Utc>) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn mark_failed(&self, _id: Uuid, _error_message: &str, _now: DateTime<Utc>) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn cancel_job(&self, _id: Uuid, _now: DateTime<Utc>) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn increment_retry_count(&self, _id: Uuid) -> Result<i32, RepoError> {
        unimplemented!()
    }
    async fn update_job_status(
        &self,
        _id: Uuid,
        _status: JobStatus,
        _container_id: Option<&str>,
        _error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn get_timed_out_jobs(&self, _max_age: chrono::Duration, _now: DateTime<Utc>) -> Result<Vec<BacktestJob>, RepoError> {
        unimplemented!()
    }
    async fn get_queue_stats(&self, _now: DateTime<Utc>) -> Result<QueueStats, RepoError> {
        Ok(self.stats.clone())
    }
    async fn create_result(&self, _result: &BacktestResult) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn get_result(&self, _id: Uuid) -> Result<BacktestResult, RepoError> {
        unimplemented!()
    }
    async fn get_result_by_job_id(&self, _job_id: Uuid) -> Result<Option<BacktestResult>, RepoError> {
        unimplemented!()
    }
    async fn query_results(&self, _filter: &ResultFilter) -> Result<Vec<BacktestResult>, RepoError> {
        unimplemented!()
    }
    async fn create_optimization_run(&self, _run: &OptimizationRun) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn get_optimization_run(&self, _id: Uuid) -> Result<OptimizationRun, RepoError> {
        unimplemented!()
    }
    async fn list_optimization_runs(&self) -> Result<Vec<OptimizationRun>, RepoError> {
        unimplemented!()
    }
    async fn set_optimization_status(&self, _id: Uuid, _status: OptimizationStatus, _now: DateTime<Utc>) -> Result<OptimizationStatus, RepoError> {
        unimplemented!()
    }
    async fn complete_optimization_run(
        &self,
        _id: Uuid,
        _best_strategy_id: Option<Uuid>,
        _best_result_id: Option<Uuid>,
        _termination_reason: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError> {
        unimplemented!()
    }
    async fn advance_optimization_iteration(
        &self,
        _id: Uuid,
        _best_strategy_id: Option<Uuid>,
        _best_result_id: Option<Uuid>,
        _now: DateTime<Utc>,
    ) -> Result<i32, RepoError> {
        unimplemented!()
    }
    async fn create_iteration(&self, _iteration: &OptimizationIteration) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn get_iteration_by_job_id(&self, _backtest_job_id: Uuid) -> Result<Option<OptimizationIteration>, RepoError> {
        unimplemented!()
    }
    async fn update_iteration_result(&self, _id: Uuid, _result_id: Uuid) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn update_iteration_feedback(&self, _id: Uuid, _agent_notes: Option<&str>, _approval: IterationApproval) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn create_scout_schedule(&self, _schedule: &ScoutSchedule) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn list_enabled_scout_schedules(&self) -> Result<Vec<ScoutSchedule>, RepoError> {
        unimplemented!()
    }
    async fn update_scout_schedule_run_times(&self, _id: Uuid, _last_run_at: DateTime<Utc>, _next_run_at: DateTime<Utc>) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn create_scout_run(&self, _run: &ScoutRun) -> Result<(), RepoError> {
        unimplemented!()
    }
    async fn update_scout_run_status(
        &self,
        _id: Uuid,
        _status: ScoutRunStatus,
        _error_message: Option<&str>,
        _metrics: Value,
        _completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        unimplemented!()
    }
}

fn make_router(stats: QueueStats) -> axum::Router {
    let repo: Arc<dyn Repository> = Arc::new(StubRepository { stats });
    let containers: Arc<dyn ContainerManager> = Arc::new(FakeContainerManager::new());
    let publisher = Arc::new(FakePublisher::new());
    let state = Arc::new(AppState::new(repo, containers, publisher, CancellationToken::new()));
    routes::build_router(state)
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    let json = serde_json::from_slice(&body).expect("body is not valid JSON");
    (status, json)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder().method("GET").uri(uri).body(axum::body::Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok_and_service_name() {
    let router = make_router(QueueStats::default());
    let (status, json) = call(router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "bt-daemon");
}

#[tokio::test]
async fn queue_stats_reflects_the_repository_snapshot() {
    let stats = QueueStats { pending: 3, running: 1, completed: 10, failed: 2, cancelled: 0, completed_today: 4, failed_today: 1 };
    let router = make_router(stats);
    let (status, json) = call(router, get("/v1/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending"], 3);
    assert_eq!(json["running"], 1);
    assert_eq!(json["completed"], 10);
    assert_eq!(json["failed_today"], 1);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let router = make_router(QueueStats::default());
    let (status, _) = call(router, get("/v1/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
