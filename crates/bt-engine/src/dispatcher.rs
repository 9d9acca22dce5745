//! Dispatcher: the only caller of `Repository::get_pending_jobs`.
//!
//! Grounded on the cron run-loop shape (`interval.tick().await` -> fetch due
//! work -> hand off -> continue) adapted from a single poll to "poll while
//! the channel has capacity" — the channel's own buffer is what enforces
//! `max_concurrent_backtests`, the dispatcher never tracks capacity itself.

use std::sync::Arc;

use bt_core::event::TaskRunning;
use bt_core::{BacktestJob, Event, JobStatus};
use bt_events::Publisher;
use bt_storage::Repository;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::config::EngineConfig;
use crate::events::publish_best_effort;

pub struct Dispatcher {
    repo: Arc<dyn Repository>,
    publisher: Arc<dyn Publisher>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(repo: Arc<dyn Repository>, publisher: Arc<dyn Publisher>, config: EngineConfig) -> Self {
        Self { repo, publisher, config }
    }

    pub fn spawn(
        self: Arc<Self>,
        tx: mpsc::Sender<BacktestJob>,
        root: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(tx, root).await })
    }

    #[instrument(skip_all)]
    async fn run(&self, tx: mpsc::Sender<BacktestJob>, root: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.dispatcher_poll_interval);
        loop {
            tokio::select! {
                _ = root.cancelled() => {
                    warn!("dispatcher stopping on root cancellation");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let free_slots = tx.capacity();
            if free_slots == 0 {
                continue;
            }

            let pending = match self.repo.get_pending_jobs(free_slots as i64).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "dispatcher failed to fetch pending jobs");
                    continue;
                }
            };

            for mut job in pending {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());

                publish_best_effort(
                    &*self.publisher,
                    Event::TaskRunning(TaskRunning {
                        job_id: job.id,
                        strategy_id: job.strategy_id,
                        container_id: String::new(),
                    }),
                    "bt-engine",
                    Utc::now(),
                )
                .await;

                // `get_pending_jobs` already performed the pending -> running
                // transition atomically; a send here blocking past this tick
                // just delays hand-off, it never violates the channel's cap.
                if tx.send(job).await.is_err() {
                    warn!("job channel closed, dispatcher stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_repo::FakeRepository;
    use bt_core::BacktestConfig;
    use bt_events::FakePublisher;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

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

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.dispatcher_poll_interval = StdDuration::from_millis(5);
        config
    }

    /// Jobs A (priority=1) and B (priority=9) submitted a millisecond apart
    /// with `max_concurrent=1` — B must be
    /// handed to the channel before A.
    #[tokio::test]
    async fn higher_priority_job_is_dispatched_first() {
        let repo = Arc::new(FakeRepository::new());
        let publisher = Arc::new(FakePublisher::new());
        let strategy_id = Uuid::new_v4();
        let now = Utc::now();

        let job_a = BacktestJob::new(strategy_id, cfg(), 1, None, now);
        let job_b = BacktestJob::new(strategy_id, cfg(), 9, None, now + chrono::Duration::milliseconds(1));
        repo.seed_job(job_a.clone());
        repo.seed_job(job_b.clone());

        let dispatcher = Arc::new(Dispatcher::new(repo.clone(), publisher.clone(), fast_config()));
        let (tx, mut rx) = mpsc::channel(1);
        let root = CancellationToken::new();
        let handle = dispatcher.spawn(tx, root.clone());

        let first = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("dispatcher should hand off the first job within the timeout")
            .expect("channel should not close before a job arrives");
        assert_eq!(first.id, job_b.id, "higher-priority job B must dispatch before A");

        let second = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("dispatcher should hand off the second job within the timeout")
            .expect("channel should not close before a job arrives");
        assert_eq!(second.id, job_a.id);

        root.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn dispatching_emits_task_running_and_marks_job_running() {
        let repo = Arc::new(FakeRepository::new());
        let publisher = Arc::new(FakePublisher::new());
        let strategy_id = Uuid::new_v4();
        let job = BacktestJob::new(strategy_id, cfg(), 5, None, Utc::now());
        repo.seed_job(job.clone());

        let dispatcher = Arc::new(Dispatcher::new(repo.clone(), publisher.clone(), fast_config()));
        let (tx, mut rx) = mpsc::channel(4);
        let root = CancellationToken::new();
        let handle = dispatcher.spawn(tx, root.clone());

        let dispatched = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("dispatcher should hand off the job")
            .expect("channel open");
        assert_eq!(dispatched.id, job.id);
        assert_eq!(dispatched.status, JobStatus::Running);

        root.cancel();
        let _ = handle.await;

        assert_eq!(publisher.published().len(), 1);
        assert_eq!(publisher.published()[0].routing_key(), "task.running");
    }
}
