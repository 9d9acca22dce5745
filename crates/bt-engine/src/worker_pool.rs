//! Worker Pool: a fixed number of worker tasks pulling jobs off the
//! dispatcher's channel and driving each one through its full lifecycle.
//!
//! Claiming jobs stays a `Dispatcher`-only capability, never called from
//! here; each worker's turn is a single bounded, instrumented span per job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bt_container::{ContainerManager, RunBacktestParams};
use bt_core::event::{TaskCompleted, TaskFailed};
use bt_core::{BacktestJob, BtError, Event};
use bt_events::Publisher;
use bt_parser::parse_backtest_output;
use bt_storage::Repository;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::publish_best_effort;
use crate::optimization_tracker::OptimizationTracker;

/// In-memory record of a job currently owned by a worker. Looked up by the
/// timeout watcher and during shutdown to stop the underlying container.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub cancel: CancellationToken,
    pub container_id: Option<String>,
}

pub type RunningJobs = RwLock<HashMap<Uuid, RunningJob>>;

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { job_id: Uuid, result_id: Uuid },
    Failed { job_id: Uuid, message: String },
    Cancelled { job_id: Uuid },
}

pub struct WorkerPool {
    repo: Arc<dyn Repository>,
    containers: Arc<dyn ContainerManager>,
    publisher: Arc<dyn Publisher>,
    optimization: Arc<OptimizationTracker>,
    config: EngineConfig,
    running: Arc<RunningJobs>,
}

impl WorkerPool {
    pub fn new(
        repo: Arc<dyn Repository>,
        containers: Arc<dyn ContainerManager>,
        publisher: Arc<dyn Publisher>,
        optimization: Arc<OptimizationTracker>,
        config: EngineConfig,
    ) -> Self {
        Self { repo, containers, publisher, optimization, config, running: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn running_jobs(&self) -> Arc<RunningJobs> {
        self.running.clone()
    }

    /// Spawns `max_concurrent_backtests` worker tasks sharing one receiver
    /// (wrapped in an async mutex — only one worker ever holds it at a time,
    /// so jobs are handed out exactly once) plus one timeout-watcher task.
    /// Returns their join handles so callers can await clean shutdown.
    pub fn spawn(
        self: Arc<Self>,
        rx: mpsc::Receiver<BacktestJob>,
        result_tx: mpsc::Sender<JobOutcome>,
        root: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(AsyncMutex::new(rx));
        let mut handles: Vec<_> = (0..self.config.max_concurrent_backtests)
            .map(|worker_id| {
                let pool = self.clone();
                let rx = rx.clone();
                let result_tx = result_tx.clone();
                let root = root.clone();
                tokio::spawn(async move { pool.worker_loop(worker_id, rx, result_tx, root).await })
            })
            .collect();

        let watcher_pool = self.clone();
        let watcher_root = root.clone();
        handles.push(tokio::spawn(async move {
            watcher_pool.timeout_watcher(watcher_root).await;
        }));

        handles
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<AsyncMutex<mpsc::Receiver<BacktestJob>>>,
        result_tx: mpsc::Sender<JobOutcome>,
        root: CancellationToken,
    ) {
        loop {
            let job = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = root.cancelled() => return,
                    job = guard.recv() => job,
                }
            };
            let Some(job) = job else { return };

            let outcome = self.run_with_retries(job, &root).await;
            if result_tx.send(outcome).await.is_err() {
                warn!(worker_id, "result channel closed, worker exiting");
                return;
            }
        }
    }

    async fn run_with_retries(&self, job: BacktestJob, root: &CancellationToken) -> JobOutcome {
        let job_id = job.id;
        let mut attempt: u32 = 0;

        loop {
            let job_cancel = root.child_token();
            self.running.write().insert(job_id, RunningJob { cancel: job_cancel.clone(), container_id: None });

            let result = self.process_job(&job, &job_cancel).await;
            self.running.write().remove(&job_id);

            match result {
                Ok(outcome) => return outcome,
                Err(err) => {
                    let retryable = err.is_retryable() && attempt < self.config.max_retries;
                    attempt += 1;

                    if retryable {
                        let _ = self.repo.increment_retry_count(job_id).await;
                        warn!(job_id = %job_id, attempt, error = %err, "retrying after infrastructural failure");
                        tokio::time::sleep(self.config.retry_backoff).await;
                        continue;
                    }

                    // `Timeout`'s payload is already the exact spec-mandated
                    // string ("job timed out") — unlike the other variants,
                    // `BtError`'s own `Display` prefix must not be layered
                    // on top of it, or this path would disagree with
                    // `reap_timed_out_job`'s identical-outcome message.
                    let message = match &err {
                        BtError::Timeout(msg) => msg.clone(),
                        other => other.to_string(),
                    };
                    let now = Utc::now();
                    if let Err(e) = self.repo.mark_failed(job_id, &message, now).await {
                        error!(job_id = %job_id, error = %e, "failed to persist job failure");
                    }
                    publish_best_effort(
                        &*self.publisher,
                        Event::TaskFailed(TaskFailed {
                            job_id,
                            strategy_id: job.strategy_id,
                            error_message: message.clone(),
                            retry_count: attempt as i32,
                        }),
                        "bt-engine",
                        now,
                    )
                    .await;
                    return JobOutcome::Failed { job_id, message };
                }
            }
        }
    }

    /// Steps 1-9 of the per-job lifecycle. Step 1 (deadline) and step 2
    /// (running-job registration) are the caller's responsibility so a
    /// retried attempt reuses the same bookkeeping path.
    #[instrument(skip_all, fields(job_id = %job.id, strategy_id = %job.strategy_id))]
    async fn process_job(
        &self,
        job: &BacktestJob,
        job_cancel: &CancellationToken,
    ) -> Result<JobOutcome, BtError> {
        if job_cancel.is_cancelled() {
            return Ok(JobOutcome::Cancelled { job_id: job.id });
        }

        let strategy = self.repo.get_strategy(job.strategy_id).await?;

        let container_id = self
            .containers
            .run_backtest(RunBacktestParams {
                job_id: job.id,
                strategy_name: strategy.name.clone(),
                strategy_code: strategy.code.clone(),
                config: job.config.clone(),
                base_config_template: self.config.base_config_template.clone(),
                exchange_trading_mode: self.config.exchange_trading_mode(&job.config.exchange),
                strategy_class_env: self.config.strategy_class_env.clone(),
                limits: Default::default(),
            })
            .await?;

        if let Some(entry) = self.running.write().get_mut(&job.id) {
            entry.container_id = Some(container_id.clone());
        }
        // `task.running` was already emitted by the dispatcher at claim
        // time; this call only backfills the container id the dispatcher
        // couldn't have known yet.
        self.repo
            .update_job_status(job.id, bt_core::JobStatus::Running, Some(&container_id), None)
            .await?;

        let wait_result = tokio::select! {
            _ = job_cancel.cancelled() => {
                let _ = self.containers.stop_container(&container_id).await;
                self.cleanup(&container_id).await;
                return Ok(JobOutcome::Cancelled { job_id: job.id });
            }
            result = tokio::time::timeout(self.config.job_timeout, self.containers.wait_container(&container_id)) => result,
        };

        let (exit_code, output) = match wait_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.cleanup(&container_id).await;
                return Err(e.into());
            }
            Err(_elapsed) => {
                warn!(job_id = %job.id, "job exceeded its deadline, stopping container");
                let _ = self.containers.stop_container(&container_id).await;
                self.cleanup(&container_id).await;
                return Err(BtError::Timeout("job timed out".to_string()));
            }
        };

        if exit_code != 0 {
            self.cleanup(&container_id).await;
            warn!(job_id = %job.id, exit_code, "container exited non-zero");
            let tail: String = output.chars().rev().take(bt_container::TAIL_BYTES).collect::<Vec<_>>().into_iter().rev().collect();
            return Err(BtError::StrategyCodeError(tail));
        }

        self.cleanup(&container_id).await;

        let now = Utc::now();
        let result = parse_backtest_output(&output, job.id, job.strategy_id, now)?;
        self.repo.create_result(&result).await?;
        self.repo.mark_completed(job.id, now).await?;

        if job.optimization_run_id.is_some() {
            match self.repo.get_iteration_by_job_id(job.id).await {
                Ok(Some(iteration)) => {
                    if let Err(e) = self.optimization.on_job_completed(&iteration, &result).await {
                        warn!(job_id = %job.id, error = %e, "failed to advance optimization iteration");
                    }
                }
                Ok(None) => warn!(job_id = %job.id, "optimization job has no matching iteration record"),
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to look up optimization iteration"),
            }
        }

        let duration_ms = (now - job.created_at).num_milliseconds().max(0);
        publish_best_effort(
            &*self.publisher,
            Event::TaskCompleted(TaskCompleted {
                job_id: job.id,
                strategy_id: job.strategy_id,
                result_id: result.id,
                duration_ms,
                sharpe_ratio: result.sharpe_ratio,
                profit_pct: result.profit_pct,
                total_trades: result.total_trades,
            }),
            "bt-engine",
            now,
        )
        .await;

        info!(job_id = %job.id, result_id = %result.id, "job completed");
        Ok(JobOutcome::Completed { job_id: job.id, result_id: result.id })
    }

    /// Guaranteed on every exit path out of `process_job` once a container
    /// exists: remove the container (best-effort; the daemon's own
    /// `CleanupStaleContainers` sweep picks up anything this misses).
    async fn cleanup(&self, container_id: &str) {
        if let Err(e) = self.containers.remove_container(container_id).await {
            warn!(container_id, error = %e, "failed to remove container during cleanup");
        }
    }

    async fn timeout_watcher(&self, root: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.timeout_watch_interval);
        loop {
            tokio::select! {
                _ = root.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let max_age = chrono::Duration::from_std(self.config.job_timeout).unwrap_or(chrono::Duration::zero());
            let timed_out = match self.repo.get_timed_out_jobs(max_age, Utc::now()).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "timeout watcher failed to query repository");
                    continue;
                }
            };

            for job in timed_out {
                self.reap_timed_out_job(&job).await;
            }
        }
    }

    async fn reap_timed_out_job(&self, job: &BacktestJob) {
        if let Some(container_id) = &job.container_id {
            if let Err(e) = self.containers.stop_container(container_id).await {
                warn!(job_id = %job.id, container_id, error = %e, "failed to stop timed-out container");
            }
        }

        let cancel = self.running.write().remove(&job.id).map(|entry| entry.cancel);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let now = Utc::now();
        if let Err(e) = self.repo.mark_failed(job.id, "job timed out", now).await {
            error!(job_id = %job.id, error = %e, "failed to mark timed-out job as failed");
            return;
        }

        publish_best_effort(
            &*self.publisher,
            Event::TaskFailed(TaskFailed {
                job_id: job.id,
                strategy_id: job.strategy_id,
                error_message: "job timed out".to_string(),
                retry_count: job.retry_count,
            }),
            "bt-engine",
            now,
        )
        .await;
    }

    /// Drains in-flight work within `shutdown_timeout`, force-stopping any
    /// container still running when the deadline passes. Jobs whose stop
    /// call fails to confirm are left running — the next startup's
    /// `CleanupStaleContainers` sweep is the backstop, matching the "marked
    /// failed only if the underlying transport confirms stop" rule.
    pub async fn shutdown(&self, handles: Vec<tokio::task::JoinHandle<()>>) {
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!("shutdown timeout elapsed, force-stopping remaining containers");
            let remaining: Vec<(Uuid, Option<String>)> = self
                .running
                .read()
                .iter()
                .map(|(id, entry)| (*id, entry.container_id.clone()))
                .collect();

            for (job_id, container_id) in remaining {
                if let Some(container_id) = container_id {
                    match self.containers.stop_container(&container_id).await {
                        Ok(()) => {
                            let _ = self.repo.mark_failed(job_id, "shutdown: container force-stopped", Utc::now()).await;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "failed to confirm stop during shutdown"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_repo::FakeRepository;
    use crate::optimization_tracker::OptimizationTracker;
    use bt_container::{FakeContainerManager, ScriptedOutcome};
    use bt_core::{BacktestConfig, JobStatus, Strategy};
    use bt_events::FakePublisher;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration as StdDuration;

    fn cfg() -> BacktestConfig {
        BacktestConfig {
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

    fn fast_config(max_retries: u32) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.max_retries = max_retries;
        config.retry_backoff = StdDuration::from_millis(1);
        config.job_timeout = StdDuration::from_secs(30);
        config
    }

    fn pool_with(
        repo: Arc<FakeRepository>,
        containers: Arc<FakeContainerManager>,
        config: EngineConfig,
    ) -> WorkerPool {
        let publisher: Arc<dyn Publisher> = Arc::new(FakePublisher::new());
        let optimization = Arc::new(OptimizationTracker::new(repo.clone(), publisher.clone()));
        WorkerPool::new(repo, containers, publisher, optimization, config)
    }

    fn seed_running_job(repo: &FakeRepository) -> (Strategy, BacktestJob) {
        let now = Utc::now();
        let strategy = Strategy::new("strat", "class Strategy: pass", None, serde_json::json!({}), now);
        repo.seed_strategy(strategy.clone());

        let mut job = BacktestJob::new(strategy.id, cfg(), 5, None, now);
        // Simulate a job already claimed by the dispatcher: Running in the
        // repository before the worker pool's own lifecycle takes over.
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        repo.seed_job(job.clone());
        (strategy, job)
    }

    #[test]
    fn running_jobs_map_starts_empty() {
        let running: RunningJobs = RwLock::new(HashMap::new());
        assert!(running.read().is_empty());
    }

    /// A strategy-code failure (non-zero exit, known error signature in the
    /// output) is never retried — exactly one
    /// attempt, final status failed, message starts with "backtest error:"
    /// ... here surfaced as `BtError::StrategyCodeError`'s Display.
    #[tokio::test]
    async fn strategy_code_error_is_not_retried() {
        let repo = Arc::new(FakeRepository::new());
        let containers = Arc::new(FakeContainerManager::new());
        let (_, job) = seed_running_job(&repo);
        containers.script(
            job.id,
            ScriptedOutcome::Exits {
                code: 1,
                output: "Traceback (most recent call last):\nNameError: foo".to_string(),
            },
        );

        let pool = pool_with(repo.clone(), containers, fast_config(5));
        let root = CancellationToken::new();
        let outcome = pool.run_with_retries(job.clone(), &root).await;

        match outcome {
            JobOutcome::Failed { job_id, message } => {
                assert_eq!(job_id, job.id);
                assert!(
                    message.starts_with("backtest error: Traceback"),
                    "message was: {message}"
                );
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        let stored = repo.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 0, "strategy-code errors must not be retried");
    }

    /// A container that never exits is caught by the worker's own in-flight
    /// `tokio::time::timeout` (not the separate `timeout_watcher` task) and
    /// must fail with the exact literal message, matching
    /// `reap_timed_out_job`'s message for the same observable outcome.
    #[tokio::test]
    async fn a_hung_container_is_caught_by_the_workers_own_deadline() {
        let repo = Arc::new(FakeRepository::new());
        let containers = Arc::new(FakeContainerManager::new());
        let (_, job) = seed_running_job(&repo);
        containers.script(job.id, ScriptedOutcome::HangsForever);

        let mut config = fast_config(0);
        config.job_timeout = StdDuration::from_millis(20);
        let pool = pool_with(repo.clone(), containers, config);
        let root = CancellationToken::new();
        let outcome = pool.run_with_retries(job.clone(), &root).await;

        match outcome {
            JobOutcome::Failed { job_id, message } => {
                assert_eq!(job_id, job.id);
                assert_eq!(message, "job timed out");
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        let stored = repo.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("job timed out"));
    }

    /// An infrastructure failure (`ContainerStartFailed`) is retried up to
    /// `max_retries`, then the job ends `failed` and
    /// `retry_count` reflects every retried attempt.
    #[tokio::test]
    async fn infrastructure_failure_is_retried_up_to_the_limit_then_fails() {
        let repo = Arc::new(FakeRepository::new());
        let containers = Arc::new(FakeContainerManager::new());
        let (_, job) = seed_running_job(&repo);
        containers.script(job.id, ScriptedOutcome::StartFails("daemon unreachable".to_string()));

        let pool = pool_with(repo.clone(), containers, fast_config(2));
        let root = CancellationToken::new();
        let outcome = pool.run_with_retries(job.clone(), &root).await;

        assert!(matches!(outcome, JobOutcome::Failed { job_id, .. } if job_id == job.id));

        let stored = repo.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.retry_count, 2, "must retry exactly max_retries times before giving up");
    }

    #[tokio::test]
    async fn successful_run_produces_a_completed_outcome_and_persists_a_result() {
        let repo = Arc::new(FakeRepository::new());
        let containers = Arc::new(FakeContainerManager::new());
        let (_, job) = seed_running_job(&repo);
        containers.script(
            job.id,
            ScriptedOutcome::Exits {
                code: 0,
                output: "Total trades: 12\nWin Rate: 83.3% (10 wins, 2 losses)\n\
                          Total profit: 300.00 USDT (4.25%)\nMax Drawdown: 50.00 USDT (5.00%)"
                    .to_string(),
            },
        );

        let pool = pool_with(repo.clone(), containers, fast_config(2));
        let root = CancellationToken::new();
        let outcome = pool.run_with_retries(job.clone(), &root).await;

        match outcome {
            JobOutcome::Completed { job_id, result_id } => {
                assert_eq!(job_id, job.id);
                let result = repo.get_result(result_id).await.unwrap();
                assert_eq!(result.total_trades, 12);
            }
            other => panic!("expected Completed, got {other:?}"),
        }

        let stored = repo.job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());
    }
}
