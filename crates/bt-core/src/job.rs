//! BacktestJob entity and its state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `status` is a monotone DAG: pending -> {running, cancelled};
/// running -> {completed, failed, cancelled}; terminal states never
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Run configuration embedded in a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub exchange: String,
    pub pairs: Vec<String>,
    pub timeframe: String,
    pub timerange_start: DateTime<Utc>,
    pub timerange_end: DateTime<Utc>,
    pub wallet_amount: f64,
    pub max_open_positions: i32,
    pub stake_amount: f64,
    /// Free-form dotted-path key/value overrides merged into the container's
    /// base config template (see `bt-container::config_merge`).
    #[serde(default)]
    pub overrides: HashMap<String, Value>,
}

impl BacktestConfig {
    /// Required keys a job submission must carry before it can be queued.
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange.trim().is_empty() {
            return Err("config.exchange is required".into());
        }
        if self.pairs.is_empty() {
            return Err("config.pairs must be non-empty".into());
        }
        if self.timeframe.trim().is_empty() {
            return Err("config.timeframe is required".into());
        }
        if self.timerange_end <= self.timerange_start {
            return Err("config.timerange_end must be after timerange_start".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestJob {
    pub id: Uuid,
    pub strategy_id: Uuid,
    pub optimization_run_id: Option<Uuid>,
    pub config: BacktestConfig,
    pub priority: i32,
    pub status: JobStatus,
    pub container_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BacktestJob {
    pub fn new(
        strategy_id: Uuid,
        config: BacktestConfig,
        priority: i32,
        optimization_run_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id,
            optimization_run_id,
            config,
            priority,
            status: JobStatus::Pending,
            container_id: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// A job may only be cancelled while pending or running.
    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}
