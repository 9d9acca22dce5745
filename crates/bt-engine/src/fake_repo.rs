//! In-memory `Repository` double shared by this crate's test modules.
//!
//! Mirrors `bt_container::fake::FakeContainerManager`'s shape: a `Mutex`
//! around a handful of `HashMap`s, good enough to drive dispatcher/worker
//! pool/optimization-tracker/cron-scheduler tests without a live Postgres.
//! Only the subset of `Repository` behavior the engine crate's own tests
//! exercise is implemented faithfully (claim ordering, conditional
//! transitions, terminal-state guards); everything else is a direct map
//! operation.

use std::collections::HashMap;

use async_trait::async_trait;
use bt_core::{
    BacktestJob, BacktestResult, IterationApproval, JobStatus, OptimizationIteration,
    OptimizationRun, OptimizationStatus, ScoutRun, ScoutRunStatus, ScoutSchedule, Strategy,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use bt_storage::{JobFilter, QueueStats, Repository, RepoError, ResultFilter};

#[derive(Default)]
struct State {
    strategies: HashMap<Uuid, Strategy>,
    jobs: HashMap<Uuid, BacktestJob>,
    results: HashMap<Uuid, BacktestResult>,
    results_by_job: HashMap<Uuid, Uuid>,
    runs: HashMap<Uuid, OptimizationRun>,
    iterations: HashMap<Uuid, OptimizationIteration>,
    iterations_by_job: HashMap<Uuid, Uuid>,
    schedules: HashMap<Uuid, ScoutSchedule>,
    scout_runs: HashMap<Uuid, ScoutRun>,
}

pub struct FakeRepository {
    state: Mutex<State>,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    pub fn seed_job(&self, job: BacktestJob) {
        self.state.lock().jobs.insert(job.id, job);
    }

    pub fn seed_strategy(&self, strategy: Strategy) {
        self.state.lock().strategies.insert(strategy.id, strategy);
    }

    pub fn seed_optimization_run(&self, run: OptimizationRun) {
        self.state.lock().runs.insert(run.id, run);
    }

    pub fn job(&self, id: Uuid) -> Option<BacktestJob> {
        self.state.lock().jobs.get(&id).cloned()
    }

    pub fn run(&self, id: Uuid) -> Option<OptimizationRun> {
        self.state.lock().runs.get(&id).cloned()
    }
}

impl Default for FakeRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn create_strategy(&self, strategy: &Strategy) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        if state.strategies.values().any(|s| s.code_hash == strategy.code_hash) {
            return Err(RepoError::Conflict(format!("duplicate code_hash {}", strategy.code_hash)));
        }
        state.strategies.insert(strategy.id, strategy.clone());
        Ok(())
    }

    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, RepoError> {
        self.state
            .lock()
            .strategies
            .get(&id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound(format!("strategy {id}")))
    }

    async fn get_strategy_by_hash(&self, code_hash: &str) -> Result<Option<Strategy>, RepoError> {
        Ok(self.state.lock().strategies.values().find(|s| s.code_hash == code_hash).cloned())
    }

    async fn delete_strategy(&self, id: Uuid) -> Result<(), RepoError> {
        self.state.lock().strategies.remove(&id);
        Ok(())
    }

    async fn create_job(&self, job: &BacktestJob) -> Result<(), RepoError> {
        self.state.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn create_jobs_batch(&self, jobs: &[BacktestJob]) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<BacktestJob, RepoError> {
        self.state.lock().jobs.get(&id).cloned().ok_or_else(|| RepoError::NotFound(format!("job {id}")))
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<BacktestJob>, RepoError> {
        let state = self.state.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.strategy_id.map_or(true, |id| j.strategy_id == id))
            .filter(|j| filter.optimization_run_id.map_or(true, |id| j.optimization_run_id == Some(id)))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(jobs)
    }

    /// Mirrors the Postgres claim's ordering and atomicity: sorted by
    /// `(priority DESC, created_at ASC)`, transitioned to `Running` in the
    /// same critical section the selection happens in so two fake
    /// repositories' worth of concurrent callers (serialized here by the
    /// `Mutex`, same end effect as `FOR UPDATE SKIP LOCKED`) never see an
    /// overlapping result set.
    async fn get_pending_jobs(&self, limit: i64) -> Result<Vec<BacktestJob>, RepoError> {
        let mut state = self.state.lock();
        let mut pending_ids: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();
        pending_ids.sort_by(|a, b| {
            let ja = &state.jobs[a];
            let jb = &state.jobs[b];
            jb.priority.cmp(&ja.priority).then(ja.created_at.cmp(&jb.created_at))
        });
        pending_ids.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(pending_ids.len());
        for id in pending_ids {
            let job = state.jobs.get_mut(&id).expect("id came from this map");
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_running(&self, id: Uuid, expected_prev_status: JobStatus, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        if job.status != expected_prev_status {
            return Err(RepoError::Conflict(format!("job {id} not in expected status")));
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Running {
            return Err(RepoError::Conflict(format!("job {id} is not running")));
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Running {
            return Err(RepoError::Conflict(format!("job {id} is not running")));
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error_message.to_string());
        job.completed_at = Some(now);
        Ok(())
    }

    async fn cancel_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        if !job.is_cancellable() {
            return Err(RepoError::Conflict(format!("job {id} is not cancellable")));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        Ok(())
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        job.retry_count += 1;
        Ok(job.retry_count)
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        container_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("job {id}")))?;
        job.status = status;
        if let Some(c) = container_id {
            job.container_id = Some(c.to_string());
        }
        if let Some(e) = error_message {
            job.error_message = Some(e.to_string());
        }
        Ok(())
    }

    async fn get_timed_out_jobs(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<BacktestJob>, RepoError> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| j.started_at.is_some_and(|started| now - started > max_age))
            .cloned()
            .collect())
    }

    async fn get_queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, RepoError> {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if job.completed_at.is_some_and(|c| c.date_naive() == now.date_naive()) {
                        stats.completed_today += 1;
                    }
                }
                JobStatus::Failed => {
                    stats.failed += 1;
                    if job.completed_at.is_some_and(|c| c.date_naive() == now.date_naive()) {
                        stats.failed_today += 1;
                    }
                }
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn create_result(&self, result: &BacktestResult) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        state.results_by_job.insert(result.job_id, result.id);
        state.results.insert(result.id, result.clone());
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<BacktestResult, RepoError> {
        self.state.lock().results.get(&id).cloned().ok_or_else(|| RepoError::NotFound(format!("result {id}")))
    }

    async fn get_result_by_job_id(&self, job_id: Uuid) -> Result<Option<BacktestResult>, RepoError> {
        let state = self.state.lock();
        Ok(state.results_by_job.get(&job_id).and_then(|id| state.results.get(id)).cloned())
    }

    async fn query_results(&self, filter: &ResultFilter) -> Result<Vec<BacktestResult>, RepoError> {
        let state = self.state.lock();
        Ok(state
            .results
            .values()
            .filter(|r| filter.strategy_id.map_or(true, |id| r.strategy_id == id))
            .filter(|r| filter.min_profit_pct.map_or(true, |min| r.profit_pct >= min))
            .filter(|r| filter.min_sharpe.map_or(true, |min| r.sharpe_ratio.is_some_and(|s| s >= min)))
            .cloned()
            .collect())
    }

    async fn create_optimization_run(&self, run: &OptimizationRun) -> Result<(), RepoError> {
        self.state.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_optimization_run(&self, id: Uuid) -> Result<OptimizationRun, RepoError> {
        self.state.lock().runs.get(&id).cloned().ok_or_else(|| RepoError::NotFound(format!("run {id}")))
    }

    async fn list_optimization_runs(&self) -> Result<Vec<OptimizationRun>, RepoError> {
        Ok(self.state.lock().runs.values().cloned().collect())
    }

    async fn set_optimization_status(&self, id: Uuid, status: OptimizationStatus, now: DateTime<Utc>) -> Result<OptimizationStatus, RepoError> {
        let mut state = self.state.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("run {id}")))?;
        let previous = run.status;
        if !previous.is_terminal() {
            run.status = status;
            run.updated_at = now;
        }
        Ok(previous)
    }

    async fn complete_optimization_run(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError> {
        let mut state = self.state.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("run {id}")))?;
        let previous = run.status;
        if !previous.is_terminal() {
            run.status = OptimizationStatus::Completed;
            if let Some(s) = best_strategy_id {
                run.best_strategy_id = Some(s);
            }
            if let Some(r) = best_result_id {
                run.best_result_id = Some(r);
            }
            if let Some(reason) = termination_reason {
                run.termination_reason = Some(reason.to_string());
            }
            run.updated_at = now;
        }
        Ok(previous)
    }

    async fn advance_optimization_iteration(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<i32, RepoError> {
        let mut state = self.state.lock();
        let run = state.runs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("run {id}")))?;
        run.current_iteration += 1;
        if let Some(s) = best_strategy_id {
            run.best_strategy_id = Some(s);
        }
        if let Some(r) = best_result_id {
            run.best_result_id = Some(r);
        }
        run.updated_at = now;
        Ok(run.current_iteration)
    }

    async fn create_iteration(&self, iteration: &OptimizationIteration) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        state.iterations_by_job.insert(iteration.backtest_job_id, iteration.id);
        state.iterations.insert(iteration.id, iteration.clone());
        Ok(())
    }

    async fn get_iteration_by_job_id(&self, backtest_job_id: Uuid) -> Result<Option<OptimizationIteration>, RepoError> {
        let state = self.state.lock();
        Ok(state.iterations_by_job.get(&backtest_job_id).and_then(|id| state.iterations.get(id)).cloned())
    }

    async fn update_iteration_result(&self, id: Uuid, result_id: Uuid) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let iteration = state.iterations.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("iteration {id}")))?;
        iteration.result_id = Some(result_id);
        Ok(())
    }

    async fn update_iteration_feedback(&self, id: Uuid, agent_notes: Option<&str>, approval: IterationApproval) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let iteration = state.iterations.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("iteration {id}")))?;
        if let Some(notes) = agent_notes {
            iteration.agent_notes = Some(notes.to_string());
        }
        iteration.approval = approval;
        Ok(())
    }

    async fn create_scout_schedule(&self, schedule: &ScoutSchedule) -> Result<(), RepoError> {
        self.state.lock().schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn list_enabled_scout_schedules(&self) -> Result<Vec<ScoutSchedule>, RepoError> {
        Ok(self.state.lock().schedules.values().filter(|s| s.enabled).cloned().collect())
    }

    async fn update_scout_schedule_run_times(&self, id: Uuid, last_run_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let schedule = state.schedules.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("schedule {id}")))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = Some(next_run_at);
        Ok(())
    }

    async fn create_scout_run(&self, run: &ScoutRun) -> Result<(), RepoError> {
        self.state.lock().scout_runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_scout_run_status(
        &self,
        id: Uuid,
        status: ScoutRunStatus,
        error_message: Option<&str>,
        metrics: Value,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock();
        let run = state.scout_runs.get_mut(&id).ok_or_else(|| RepoError::NotFound(format!("scout run {id}")))?;
        run.status = status;
        run.error_message = error_message.map(|s| s.to_string());
        run.metrics = metrics;
        run.completed_at = completed_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn cfg() -> bt_core::BacktestConfig {
        bt_core::BacktestConfig {
            exchange: "binance".into(),
            pairs: vec!["BTC/USDT".into()],
            timeframe: "5m".into(),
            timerange_start: Utc::now() - chrono::Duration::days(30),
            timerange_end: Utc::now(),
            wallet_amount: 1000.0,
            max_open_positions: 3,
            stake_amount: 100.0,
            overrides: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn get_pending_jobs_orders_by_priority_then_age() {
        let repo = FakeRepository::new();
        let strategy_id = Uuid::new_v4();
        let now = Utc::now();

        let low = BacktestJob::new(strategy_id, cfg(), 1, None, now);
        let high = BacktestJob::new(strategy_id, cfg(), 9, None, now + chrono::Duration::milliseconds(1));
        repo.seed_job(low.clone());
        repo.seed_job(high.clone());

        let claimed = repo.get_pending_jobs(10).await.unwrap();
        assert_eq!(claimed[0].id, high.id, "higher priority must be claimed first despite being submitted later");
        assert_eq!(claimed[1].id, low.id);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));
    }

    #[tokio::test]
    async fn get_pending_jobs_never_returns_the_same_job_twice() {
        let repo = FakeRepository::new();
        let strategy_id = Uuid::new_v4();
        let now = Utc::now();
        for i in 0..5 {
            repo.seed_job(BacktestJob::new(strategy_id, cfg(), i, None, now));
        }

        let first = repo.get_pending_jobs(3).await.unwrap();
        let second = repo.get_pending_jobs(10).await.unwrap();
        let first_ids: std::collections::HashSet<_> = first.iter().map(|j| j.id).collect();
        let second_ids: std::collections::HashSet<_> = second.iter().map(|j| j.id).collect();
        assert!(first_ids.is_disjoint(&second_ids));
        assert_eq!(first_ids.len() + second_ids.len(), 5);
    }

    #[tokio::test]
    async fn cancelling_a_terminal_job_is_rejected() {
        let repo = FakeRepository::new();
        let strategy_id = Uuid::new_v4();
        let now = Utc::now();
        let mut job = BacktestJob::new(strategy_id, cfg(), 0, None, now);
        job.status = JobStatus::Completed;
        repo.seed_job(job.clone());

        let err = repo.cancel_job(job.id, now).await.unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
    }
}
