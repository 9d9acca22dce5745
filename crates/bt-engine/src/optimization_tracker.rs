//! Optimization Tracker: iteration bookkeeping and the run's control
//! surface (pause/resume/cancel/complete/fail). The status-transition shape
//! mirrors the job state machine, and the race in the complete-run control
//! operation is closed in `bt_storage::pg::complete_optimization_run`: the
//! previous status and the write happen in one round trip.

use std::sync::Arc;

use bt_core::event::OptimizationIterationEvent;
use bt_core::{BacktestResult, BtError, Event, ObjectiveMode, OptimizationIteration, OptimizationStatus};
use bt_events::Publisher;
use bt_storage::Repository;
use chrono::Utc;
use uuid::Uuid;

use crate::events::publish_best_effort;

pub struct OptimizationTracker {
    repo: Arc<dyn Repository>,
    publisher: Arc<dyn Publisher>,
}

impl OptimizationTracker {
    pub fn new(repo: Arc<dyn Repository>, publisher: Arc<dyn Publisher>) -> Self {
        Self { repo, publisher }
    }

    /// Called when a job belonging to `run_id` is submitted: adds the next
    /// iteration record ahead of the job actually running.
    pub async fn on_job_submitted(
        &self,
        run_id: Uuid,
        strategy_id: Uuid,
        backtest_job_id: Uuid,
    ) -> Result<OptimizationIteration, BtError> {
        let run = self.repo.get_optimization_run(run_id).await?;
        let iteration = OptimizationIteration::new(
            run_id,
            run.current_iteration + 1,
            strategy_id,
            backtest_job_id,
            Utc::now(),
        );
        self.repo.create_iteration(&iteration).await?;
        Ok(iteration)
    }

    /// Called when the job behind `iteration` completes. Advances
    /// `current_iteration`, compares `result` against the stored best under
    /// the run's objective, updates the best-pointers if it wins, and
    /// always emits `optimization.iteration`.
    pub async fn on_job_completed(
        &self,
        iteration: &OptimizationIteration,
        result: &BacktestResult,
    ) -> Result<bool, BtError> {
        let run = self.repo.get_optimization_run(iteration.optimization_run_id).await?;

        let current_best = match run.best_result_id {
            Some(best_result_id) => {
                let stored = self.repo.get_result(best_result_id).await?;
                Some(self.objective_value(run.objective, &stored))
            }
            None => None,
        };
        let candidate = self.objective_value(run.objective, result);
        let is_best = run.candidate_is_better(current_best, candidate);

        let now = Utc::now();
        self.repo
            .advance_optimization_iteration(
                iteration.optimization_run_id,
                is_best.then_some(iteration.strategy_id),
                is_best.then_some(result.id),
                now,
            )
            .await?;
        self.repo.update_iteration_result(iteration.id, result.id).await?;

        publish_best_effort(
            &*self.publisher,
            Event::OptimizationIteration(OptimizationIterationEvent {
                run_id: iteration.optimization_run_id,
                iteration_number: iteration.iteration_number,
                strategy_id: iteration.strategy_id,
                result_id: Some(result.id),
                sharpe_ratio: result.sharpe_ratio,
                profit_pct: result.profit_pct,
                is_best,
            }),
            "bt-engine",
            now,
        )
        .await;

        Ok(is_best)
    }

    fn objective_value(&self, objective: ObjectiveMode, result: &BacktestResult) -> f64 {
        match objective {
            ObjectiveMode::MaximizeSharpe => result.sharpe_ratio.unwrap_or(f64::MIN),
            ObjectiveMode::MaximizeProfit => result.profit_pct,
            ObjectiveMode::MinimizeDrawdown => result.max_drawdown_pct,
            ObjectiveMode::Composite => result.sharpe_ratio.unwrap_or(0.0) + result.profit_pct,
        }
    }

    pub async fn pause(&self, run_id: Uuid) -> Result<OptimizationStatus, BtError> {
        self.transition(run_id, OptimizationStatus::Paused).await
    }

    pub async fn resume(&self, run_id: Uuid) -> Result<OptimizationStatus, BtError> {
        self.transition(run_id, OptimizationStatus::Running).await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<OptimizationStatus, BtError> {
        self.transition(run_id, OptimizationStatus::Cancelled).await
    }

    pub async fn fail(&self, run_id: Uuid) -> Result<OptimizationStatus, BtError> {
        self.transition(run_id, OptimizationStatus::Failed).await
    }

    /// `complete` is the one control operation with a documented race
    /// (between reading the prior status for the emitted event and writing
    /// the new one). Closed by `complete_optimization_run`'s single
    /// `UPDATE ... RETURNING` round trip.
    pub async fn complete(
        &self,
        run_id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        termination_reason: Option<&str>,
    ) -> Result<OptimizationStatus, BtError> {
        let now = Utc::now();
        let previous = self
            .repo
            .complete_optimization_run(run_id, best_strategy_id, best_result_id, termination_reason, now)
            .await?;
        if previous.is_terminal() {
            return Err(BtError::Conflict(format!(
                "optimization run {run_id} already in terminal state {previous:?}"
            )));
        }
        Ok(OptimizationStatus::Completed)
    }

    async fn transition(&self, run_id: Uuid, target: OptimizationStatus) -> Result<OptimizationStatus, BtError> {
        let now = Utc::now();
        let previous = self.repo.set_optimization_status(run_id, target, now).await?;
        if !previous.can_transition_to(target) {
            return Err(BtError::Conflict(format!(
                "optimization run {run_id} cannot transition from {previous:?} to {target:?}"
            )));
        }
        Ok(target)
    }
}
