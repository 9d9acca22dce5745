//! `Repository` trait: the sole mutator of persisted state.
//!
//! Everything else in the workspace — worker pool, dispatcher, optimization
//! tracker, cron scheduler — reaches the database only through this trait.
//! It's `#[async_trait]` and object-safe so `bt-engine` can hold a
//! `Arc<dyn Repository>` and swap in a fake for unit tests that don't need a
//! live Postgres.

use async_trait::async_trait;
use bt_core::{
    BacktestJob, BacktestResult, IterationApproval, JobStatus, OptimizationIteration,
    OptimizationRun, OptimizationStatus, ScoutRun, ScoutRunStatus, ScoutSchedule, Strategy,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RepoError;

/// Filter for `Repository::query_jobs`. All fields are optional; an unset
/// field imposes no constraint. `limit`/`offset` page the (priority desc,
/// created_at asc) ordering used everywhere else jobs are listed.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub strategy_id: Option<Uuid>,
    pub optimization_run_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn paginated(limit: i64, offset: i64) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }
}

/// Filter for `Repository::query_results`. `min_profit_pct`/`min_sharpe`
/// filter by metric thresholds.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub strategy_id: Option<Uuid>,
    pub min_profit_pct: Option<f64>,
    pub min_sharpe: Option<f64>,
    pub limit: i64,
    pub offset: i64,
}

impl ResultFilter {
    pub fn paginated(limit: i64, offset: i64) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub completed_today: i64,
    pub failed_today: i64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // --- Strategies ---
    async fn create_strategy(&self, strategy: &Strategy) -> Result<(), RepoError>;
    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, RepoError>;
    async fn get_strategy_by_hash(&self, code_hash: &str) -> Result<Option<Strategy>, RepoError>;
    async fn delete_strategy(&self, id: Uuid) -> Result<(), RepoError>;

    // --- Jobs ---
    async fn create_job(&self, job: &BacktestJob) -> Result<(), RepoError>;
    async fn create_jobs_batch(&self, jobs: &[BacktestJob]) -> Result<(), RepoError>;
    async fn get_job(&self, id: Uuid) -> Result<BacktestJob, RepoError>;
    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<BacktestJob>, RepoError>;
    /// Concurrent-safe claim: atomically transitions up to `limit` pending
    /// jobs ordered by `(priority DESC, created_at ASC)` to `Running` and
    /// returns them already in that state. Two callers racing this never
    /// observe an overlapping result set — the claim and the status write
    /// happen in the same statement (`FOR UPDATE SKIP LOCKED` folded into
    /// the `UPDATE`), so the row lock's release can't open a window for a
    /// second caller to grab the same job.
    async fn get_pending_jobs(&self, limit: i64) -> Result<Vec<BacktestJob>, RepoError>;
    /// Used for transitions other than the initial claim (`get_pending_jobs`
    /// already performs pending -> running atomically) — e.g. a retried job
    /// re-entering `Running` from `Pending` after `increment_retry_count`.
    async fn mark_running(
        &self,
        id: Uuid,
        expected_prev_status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError>;
    async fn mark_failed(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn cancel_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError>;
    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, RepoError>;
    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        container_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), RepoError>;
    async fn get_timed_out_jobs(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<BacktestJob>, RepoError>;
    async fn get_queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, RepoError>;

    // --- Results ---
    async fn create_result(&self, result: &BacktestResult) -> Result<(), RepoError>;
    async fn get_result(&self, id: Uuid) -> Result<BacktestResult, RepoError>;
    async fn get_result_by_job_id(&self, job_id: Uuid) -> Result<Option<BacktestResult>, RepoError>;
    async fn query_results(&self, filter: &ResultFilter) -> Result<Vec<BacktestResult>, RepoError>;

    // --- Optimization ---
    async fn create_optimization_run(&self, run: &OptimizationRun) -> Result<(), RepoError>;
    async fn get_optimization_run(&self, id: Uuid) -> Result<OptimizationRun, RepoError>;
    async fn list_optimization_runs(&self) -> Result<Vec<OptimizationRun>, RepoError>;
    async fn set_optimization_status(
        &self,
        id: Uuid,
        status: OptimizationStatus,
        now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError>;
    /// Closes the §9 Open Question race: the previous status is returned
    /// from the same `UPDATE ... RETURNING` round trip that performs the
    /// transition, so "read old status for the event" and "write new
    /// status" can never interleave across two concurrent callers.
    async fn complete_optimization_run(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError>;
    async fn advance_optimization_iteration(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<i32, RepoError>;
    async fn create_iteration(&self, iteration: &OptimizationIteration) -> Result<(), RepoError>;
    async fn get_iteration_by_job_id(&self, backtest_job_id: Uuid) -> Result<Option<OptimizationIteration>, RepoError>;
    async fn update_iteration_result(&self, id: Uuid, result_id: Uuid) -> Result<(), RepoError>;
    async fn update_iteration_feedback(
        &self,
        id: Uuid,
        agent_notes: Option<&str>,
        approval: IterationApproval,
    ) -> Result<(), RepoError>;

    // --- Scout ---
    async fn create_scout_schedule(&self, schedule: &ScoutSchedule) -> Result<(), RepoError>;
    async fn list_enabled_scout_schedules(&self) -> Result<Vec<ScoutSchedule>, RepoError>;
    async fn update_scout_schedule_run_times(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;
    async fn create_scout_run(&self, run: &ScoutRun) -> Result<(), RepoError>;
    async fn update_scout_run_status(
        &self,
        id: Uuid,
        status: ScoutRunStatus,
        error_message: Option<&str>,
        metrics: Value,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError>;
}
