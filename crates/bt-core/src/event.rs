//! Wire event envelope and payloads published to the topic exchange.
//!
//! Routing keys are `<entity>.<verb>` (`task.created`, `optimization.iteration`,
//! `scout.trigger`, ...). `Event::routing_key` is the single source of truth
//! for that string so the publisher and any test asserting on it can't drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    pub job_id: Uuid,
    pub strategy_id: Uuid,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunning {
    pub job_id: Uuid,
    pub strategy_id: Uuid,
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub job_id: Uuid,
    pub strategy_id: Uuid,
    pub result_id: Uuid,
    pub duration_ms: i64,
    pub sharpe_ratio: Option<f64>,
    pub profit_pct: f64,
    pub total_trades: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailed {
    pub job_id: Uuid,
    pub strategy_id: Uuid,
    pub error_message: String,
    pub retry_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelled {
    pub job_id: Uuid,
    pub strategy_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationIterationEvent {
    pub run_id: Uuid,
    pub iteration_number: i32,
    pub strategy_id: Uuid,
    pub result_id: Option<Uuid>,
    pub sharpe_ratio: Option<f64>,
    pub profit_pct: f64,
    pub is_best: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutTrigger {
    pub run_id: Uuid,
    pub source: String,
    pub max_strategies: i32,
    pub trigger_type: String,
    pub triggered_by: String,
}

/// The payload half of a published message. Variant order mirrors the
/// routing-key table; `#[serde(untagged)]` is deliberately not used — the
/// envelope's `event_type` carries the tag, the payload is flattened
/// alongside it on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Event {
    #[serde(rename = "task.created")]
    TaskCreated(TaskCreated),
    #[serde(rename = "task.running")]
    TaskRunning(TaskRunning),
    #[serde(rename = "task.completed")]
    TaskCompleted(TaskCompleted),
    #[serde(rename = "task.failed")]
    TaskFailed(TaskFailed),
    #[serde(rename = "task.cancelled")]
    TaskCancelled(TaskCancelled),
    #[serde(rename = "optimization.iteration")]
    OptimizationIteration(OptimizationIterationEvent),
    #[serde(rename = "scout.trigger")]
    ScoutTrigger(ScoutTrigger),
}

impl Event {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Event::TaskCreated(_) => "task.created",
            Event::TaskRunning(_) => "task.running",
            Event::TaskCompleted(_) => "task.completed",
            Event::TaskFailed(_) => "task.failed",
            Event::TaskCancelled(_) => "task.cancelled",
            Event::OptimizationIteration(_) => "optimization.iteration",
            Event::ScoutTrigger(_) => "scout.trigger",
        }
    }
}

/// Common envelope every published message carries, regardless of payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(event: Event, source: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: now,
            source: source.into(),
            event,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.event.routing_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_matches_envelope_serialization() {
        let env = Envelope::new(
            Event::TaskRunning(TaskRunning {
                job_id: Uuid::new_v4(),
                strategy_id: Uuid::new_v4(),
                container_id: "c1".into(),
            }),
            "bt-engine",
            Utc::now(),
        );
        assert_eq!(env.routing_key(), "task.running");

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["event_type"], "task.running");
        assert_eq!(json["container_id"], "c1");
    }

    #[test]
    fn scout_trigger_carries_trigger_type_not_a_separate_routing_key() {
        let env = Envelope::new(
            Event::ScoutTrigger(ScoutTrigger {
                run_id: Uuid::new_v4(),
                source: "top_gainers".into(),
                max_strategies: 10,
                trigger_type: "scheduled".into(),
                triggered_by: "nightly".into(),
            }),
            "bt-engine",
            Utc::now(),
        );
        assert_eq!(env.routing_key(), "scout.trigger");
    }
}
