//! In-process `ContainerManager` double, scripted per job id. Lets worker
//! pool tests drive the full job lifecycle without a Docker daemon.

use std::collections::HashMap as StdHashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::ContainerError;
use crate::manager::{ContainerManager, RunBacktestParams, ValidationVerdict};

#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Exits { code: i64, output: String },
    StartFails(String),
    HangsForever,
}

pub struct FakeContainerManager {
    scripts: Mutex<StdHashMap<Uuid, ScriptedOutcome>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl FakeContainerManager {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(StdHashMap::new()),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the outcome `run_backtest`/`wait_container` produce for the
    /// container started on behalf of `job_id`.
    pub fn script(&self, job_id: Uuid, outcome: ScriptedOutcome) {
        self.scripts.lock().insert(job_id, outcome);
    }

    pub fn stopped_containers(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl Default for FakeContainerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerManager for FakeContainerManager {
    async fn run_backtest(&self, params: RunBacktestParams) -> Result<String, ContainerError> {
        let container_id = format!("fake-{}", params.job_id);
        if let Some(ScriptedOutcome::StartFails(msg)) = self.scripts.lock().get(&params.job_id) {
            return Err(ContainerError::StartFailed(msg.clone()));
        }
        self.started.lock().push(container_id.clone());
        Ok(container_id)
    }

    async fn wait_container(&self, id: &str) -> Result<(i64, String), ContainerError> {
        let job_id = job_id_from_container(id)?;
        match self.scripts.lock().get(&job_id) {
            Some(ScriptedOutcome::Exits { code, output }) => Ok((*code, output.clone())),
            Some(ScriptedOutcome::HangsForever) => std::future::pending().await,
            Some(ScriptedOutcome::StartFails(_)) | None => {
                Err(ContainerError::NotFound(format!("no scripted wait outcome for {id}")))
            }
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        self.stopped.lock().push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        self.removed.lock().push(id.to_string());
        Ok(())
    }

    async fn get_container_logs(&self, _id: &str) -> Result<String, ContainerError> {
        Ok(String::new())
    }

    async fn is_container_running(&self, id: &str) -> Result<bool, ContainerError> {
        Ok(!self.stopped.lock().contains(&id.to_string()))
    }

    async fn cleanup_stale_containers(&self, _max_age: Duration) -> Result<usize, ContainerError> {
        Ok(0)
    }

    async fn validate_strategy(&self, _code: &str, _name: &str) -> Result<ValidationVerdict, ContainerError> {
        Ok(ValidationVerdict { valid: true, errors: Vec::new(), warnings: Vec::new() })
    }
}

fn job_id_from_container(id: &str) -> Result<Uuid, ContainerError> {
    id.strip_prefix("fake-")
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ContainerError::NotFound(format!("not a fake container id: {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt_core::BacktestConfig;
    use std::collections::HashMap;

    fn params(job_id: Uuid) -> RunBacktestParams {
        RunBacktestParams {
            job_id,
            strategy_name: "strat".into(),
            strategy_code: "pass".into(),
            config: BacktestConfig {
                exchange: "binance".into(),
                pairs: vec!["BTC/USDT".into()],
                timeframe: "5m".into(),
                timerange_start: chrono::Utc::now(),
                timerange_end: chrono::Utc::now(),
                wallet_amount: 1000.0,
                max_open_positions: 1,
                stake_amount: 10.0,
                overrides: HashMap::new(),
            },
            base_config_template: serde_json::json!({}),
            exchange_trading_mode: None,
            strategy_class_env: "Strategy".into(),
            limits: Default::default(),
        }
    }

    #[tokio::test]
    async fn scripted_exit_is_returned_from_wait() {
        let fake = FakeContainerManager::new();
        let job_id = Uuid::new_v4();
        fake.script(job_id, ScriptedOutcome::Exits { code: 0, output: "ok".into() });

        let id = fake.run_backtest(params(job_id)).await.unwrap();
        let (code, output) = fake.wait_container(&id).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(output, "ok");
    }

    #[tokio::test]
    async fn scripted_start_failure_is_returned_from_run_backtest() {
        let fake = FakeContainerManager::new();
        let job_id = Uuid::new_v4();
        fake.script(job_id, ScriptedOutcome::StartFails("daemon unreachable".into()));

        let err = fake.run_backtest(params(job_id)).await.unwrap_err();
        assert!(matches!(err, ContainerError::StartFailed(_)));
    }

    #[tokio::test]
    async fn stop_and_remove_are_recorded() {
        let fake = FakeContainerManager::new();
        fake.stop_container("fake-x").await.unwrap();
        fake.remove_container("fake-x").await.unwrap();
        assert_eq!(fake.stopped_containers(), vec!["fake-x".to_string()]);
        assert_eq!(fake.removed_containers(), vec!["fake-x".to_string()]);
    }
}
