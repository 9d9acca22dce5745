//! Cron Trigger Scheduler: evaluates a small in-memory schedule map on a
//! fixed poll interval and publishes `scout.trigger` for anything due.
//!
//! Reload the active set, walk it for due work, re-tick. Runs independently
//! of the job queue — it only ever writes `ScoutRun` rows and bumps a
//! schedule's run timestamps, never touching `BacktestJob`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use bt_core::event::ScoutTrigger as ScoutTriggerEvent;
use bt_core::{Event, ScoutSchedule};
use bt_events::Publisher;
use bt_storage::{RepoError, Repository};
use chrono::{DateTime, Utc};
use cron::Schedule as CronExpr;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::publish_best_effort;

struct ScheduleEntry {
    schedule: ScoutSchedule,
    next_run_at: DateTime<Utc>,
    parsed: CronExpr,
}

pub struct CronScheduler {
    repo: Arc<dyn Repository>,
    publisher: Arc<dyn Publisher>,
    config: EngineConfig,
    schedules: tokio::sync::Mutex<HashMap<Uuid, ScheduleEntry>>,
}

impl CronScheduler {
    pub fn new(repo: Arc<dyn Repository>, publisher: Arc<dyn Publisher>, config: EngineConfig) -> Self {
        Self { repo, publisher, config, schedules: tokio::sync::Mutex::new(HashMap::new()) }
    }

    pub fn spawn(self: Arc<Self>, root: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(root).await })
    }

    async fn run(&self, root: CancellationToken) {
        if let Err(e) = self.reload_schedules().await {
            error!(error = %e, "initial schedule load failed");
        }

        let mut ticker = tokio::time::interval(self.config.cron_poll_interval);
        loop {
            tokio::select! {
                _ = root.cancelled() => {
                    warn!("cron scheduler stopping on root cancellation");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.reload_schedules().await {
                error!(error = %e, "failed to reload schedules");
            }
            self.fire_due_schedules().await;
        }
    }

    /// Re-reads the enabled set from storage. A schedule with an
    /// unparseable cron expression is logged and dropped from the in-memory
    /// map rather than failing the whole reload.
    pub async fn reload_schedules(&self) -> Result<(), RepoError> {
        let now = Utc::now();
        let active = self.repo.list_enabled_scout_schedules().await?;
        let mut schedules = self.schedules.lock().await;

        let active_ids: std::collections::HashSet<Uuid> = active.iter().map(|s| s.id).collect();
        schedules.retain(|id, _| active_ids.contains(id));

        for schedule in active {
            let parsed = match CronExpr::from_str(&schedule.cron_expression) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(schedule = %schedule.name, expression = %schedule.cron_expression, error = %e, "malformed cron expression, skipping");
                    schedules.remove(&schedule.id);
                    continue;
                }
            };

            let next_run_at = match schedule.next_run_at {
                Some(next) => next,
                None => match parsed.after(&now).next() {
                    Some(next) => next,
                    None => {
                        warn!(schedule = %schedule.name, "cron expression has no future occurrence, skipping");
                        continue;
                    }
                },
            };

            schedules.insert(schedule.id, ScheduleEntry { schedule, next_run_at, parsed });
        }

        Ok(())
    }

    async fn fire_due_schedules(&self) {
        let now = Utc::now();
        let due: Vec<Uuid> = {
            let schedules = self.schedules.lock().await;
            schedules
                .values()
                .filter(|entry| entry.schedule.enabled && entry.next_run_at <= now)
                .map(|entry| entry.schedule.id)
                .collect()
        };

        for id in due {
            self.fire_schedule(id, now).await;
        }
    }

    async fn fire_schedule(&self, id: Uuid, now: DateTime<Utc>) {
        let (schedule, next) = {
            let schedules = self.schedules.lock().await;
            let Some(entry) = schedules.get(&id) else { return };
            let next = entry.parsed.after(&now).next().unwrap_or(now + chrono::Duration::days(365));
            (entry.schedule.clone(), next)
        };

        let run = bt_core::ScoutRun::new_scheduled(&schedule, now);
        if let Err(e) = self.repo.create_scout_run(&run).await {
            error!(schedule = %schedule.name, error = %e, "failed to create scout run");
            return;
        }

        if let Err(e) = self.repo.update_scout_schedule_run_times(id, now, next).await {
            error!(schedule = %schedule.name, error = %e, "failed to persist schedule run times");
        }

        {
            let mut schedules = self.schedules.lock().await;
            if let Some(entry) = schedules.get_mut(&id) {
                entry.schedule.last_run_at = Some(now);
                entry.schedule.next_run_at = Some(next);
                entry.next_run_at = next;
            }
        }

        publish_best_effort(
            &*self.publisher,
            Event::ScoutTrigger(ScoutTriggerEvent {
                run_id: run.id,
                source: schedule.source.clone(),
                max_strategies: schedule.max_strategies,
                trigger_type: "scheduled".to_string(),
                triggered_by: schedule.name.clone(),
            }),
            "bt-engine",
            now,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_repo::FakeRepository;
    use bt_events::FakePublisher;

    #[test]
    fn every_minute_expression_parses() {
        let parsed = CronExpr::from_str("0 * * * * *").expect("valid cron expression");
        let now = Utc::now();
        let next = parsed.after(&now).next().expect("has a next occurrence");
        assert!(next > now);
    }

    #[test]
    fn malformed_expression_fails_to_parse() {
        assert!(CronExpr::from_str("not a cron expression").is_err());
    }

    /// Every enabled schedule with a valid cron expression must have its
    /// `next_run_at` strictly advance past the previous value after each
    /// firing.
    #[tokio::test]
    async fn a_due_schedule_fires_advances_next_run_and_publishes_a_trigger() {
        let repo = Arc::new(FakeRepository::new());
        let publisher = Arc::new(FakePublisher::new());
        let now = Utc::now();

        let mut schedule = ScoutSchedule::new("nightly", "0 * * * * *", "top_gainers", 10, now);
        schedule.next_run_at = Some(now - chrono::Duration::minutes(1));
        repo.create_scout_schedule(&schedule).await.unwrap();

        let scheduler = CronScheduler::new(repo.clone(), publisher.clone(), EngineConfig::default());
        scheduler.reload_schedules().await.unwrap();

        let previous_next_run_at = schedule.next_run_at.unwrap();
        scheduler.fire_due_schedules().await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key(), "scout.trigger");

        let schedules = scheduler.schedules.lock().await;
        let entry = schedules.get(&schedule.id).expect("schedule stays tracked after firing");
        assert!(
            entry.next_run_at > previous_next_run_at,
            "next_run_at must advance strictly past its previous value after firing"
        );
    }

    /// A schedule whose `next_run_at` is still in the future must not fire,
    /// and a disabled schedule is excluded from the reloaded active set.
    #[tokio::test]
    async fn schedules_not_yet_due_or_disabled_do_not_fire() {
        let repo = Arc::new(FakeRepository::new());
        let publisher = Arc::new(FakePublisher::new());
        let now = Utc::now();

        let mut not_due = ScoutSchedule::new("far-future", "0 0 0 1 1 *", "top_gainers", 5, now);
        not_due.next_run_at = Some(now + chrono::Duration::days(1));
        repo.create_scout_schedule(&not_due).await.unwrap();

        let mut disabled = ScoutSchedule::new("disabled", "0 * * * * *", "top_gainers", 5, now);
        disabled.enabled = false;
        disabled.next_run_at = Some(now - chrono::Duration::minutes(1));
        repo.create_scout_schedule(&disabled).await.unwrap();

        let scheduler = CronScheduler::new(repo.clone(), publisher.clone(), EngineConfig::default());
        scheduler.reload_schedules().await.unwrap();
        scheduler.fire_due_schedules().await;

        assert!(publisher.published().is_empty());
    }
}
