//! ScoutSchedule / ScoutRun: cron-driven triggers that share the claim/publish
//! idiom with backtest jobs but live in their own, much smaller, lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Carried in the `scout.trigger` payload so one routing key serves both
/// scheduled and ad-hoc triggers; the consumer dispatches on this field
/// instead of the publisher needing separate routing keys per source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoutRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A named cron trigger. `name` is unique; disabling a schedule removes it
/// from the scheduler's poll set without deleting the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutSchedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub source: String,
    pub max_strategies: i32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScoutSchedule {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        source: impl Into<String>,
        max_strategies: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            source: source.into(),
            max_strategies,
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutRun {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub source: String,
    pub max_strategies: i32,
    pub status: ScoutRunStatus,
    pub error_message: Option<String>,
    pub metrics: Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScoutRun {
    pub fn new_scheduled(schedule: &ScoutSchedule, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id: Some(schedule.id),
            trigger_type: TriggerType::Scheduled,
            triggered_by: schedule.name.clone(),
            source: schedule.source.clone(),
            max_strategies: schedule.max_strategies,
            status: ScoutRunStatus::Pending,
            error_message: None,
            metrics: Value::Object(Default::default()),
            created_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_not_due_when_disabled() {
        let mut s = ScoutSchedule::new("nightly", "0 0 * * *", "top_gainers", 10, Utc::now());
        s.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(s.is_due(Utc::now()));
        s.enabled = false;
        assert!(!s.is_due(Utc::now()));
    }

    #[test]
    fn schedule_not_due_without_next_run_at() {
        let s = ScoutSchedule::new("nightly", "0 0 * * *", "top_gainers", 10, Utc::now());
        assert!(!s.is_due(Utc::now()));
    }

    #[test]
    fn scheduled_run_carries_schedule_identity() {
        let s = ScoutSchedule::new("nightly", "0 0 * * *", "top_gainers", 10, Utc::now());
        let run = ScoutRun::new_scheduled(&s, Utc::now());
        assert_eq!(run.trigger_type, TriggerType::Scheduled);
        assert_eq!(run.triggered_by, "nightly");
        assert_eq!(run.schedule_id, Some(s.id));
    }
}
