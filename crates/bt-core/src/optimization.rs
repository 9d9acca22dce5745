//! OptimizationRun / OptimizationIteration: grouping successive submissions
//! under iterative acceptance criteria.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::BacktestConfig;

/// Which metric `is_best` comparisons are made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMode {
    MaximizeSharpe,
    MaximizeProfit,
    MinimizeDrawdown,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OptimizationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OptimizationStatus::Completed | OptimizationStatus::Failed | OptimizationStatus::Cancelled
        )
    }

    /// Mirrors the job state machine's shape: pending/running are the only
    /// non-terminal states, paused only reachable from running and only
    /// escapable back to running or a terminal state.
    pub fn can_transition_to(self, next: OptimizationStatus) -> bool {
        use OptimizationStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            (Paused, Running) | (Paused, Completed) | (Paused, Failed) | (Paused, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationApproval {
    Pending,
    Approved,
    Rejected,
    NeedsIteration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub id: Uuid,
    pub name: String,
    pub base_strategy_id: Uuid,
    pub config: BacktestConfig,
    pub objective: ObjectiveMode,
    pub status: OptimizationStatus,
    pub current_iteration: i32,
    pub max_iterations: i32,
    pub best_strategy_id: Option<Uuid>,
    pub best_result_id: Option<Uuid>,
    pub termination_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OptimizationRun {
    pub fn new(
        name: impl Into<String>,
        base_strategy_id: Uuid,
        config: BacktestConfig,
        objective: ObjectiveMode,
        max_iterations: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            base_strategy_id,
            config,
            objective,
            status: OptimizationStatus::Pending,
            current_iteration: 0,
            max_iterations,
            best_strategy_id: None,
            best_result_id: None,
            termination_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether advancing to `current_iteration + 1` stays within budget.
    pub fn has_iteration_budget(&self) -> bool {
        self.current_iteration < self.max_iterations
    }

    /// Decide whether a new candidate's metric beats the stored best under
    /// this run's objective. `None` best always loses to any candidate.
    pub fn candidate_is_better(&self, best: Option<f64>, candidate: f64) -> bool {
        let Some(best) = best else { return true };
        match self.objective {
            ObjectiveMode::MaximizeSharpe | ObjectiveMode::MaximizeProfit | ObjectiveMode::Composite => {
                candidate > best
            }
            ObjectiveMode::MinimizeDrawdown => candidate < best,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationIteration {
    pub id: Uuid,
    pub optimization_run_id: Uuid,
    pub iteration_number: i32,
    pub strategy_id: Uuid,
    pub backtest_job_id: Uuid,
    pub result_id: Option<Uuid>,
    pub agent_notes: Option<String>,
    pub approval: IterationApproval,
    pub created_at: DateTime<Utc>,
}

impl OptimizationIteration {
    pub fn new(
        optimization_run_id: Uuid,
        iteration_number: i32,
        strategy_id: Uuid,
        backtest_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            optimization_run_id,
            iteration_number,
            strategy_id,
            backtest_job_id,
            result_id: None,
            agent_notes: None,
            approval: IterationApproval::Pending,
            created_at: now,
        }
    }
}
