//! `ContainerManager`: materializes inputs, starts, waits on, and tears down
//! a single sandboxed backtest run.

use std::collections::HashMap as StdHashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bt_core::BacktestConfig;
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config_merge::merge_base_template;
use crate::error::ContainerError;

/// Bytes kept from the tail of non-zero-exit container output, surfaced as
/// a normal return rather than an error.
pub const TAIL_BYTES: usize = 4096;

/// Label applied to every container this service creates, so
/// `CleanupStaleContainers` can find them by label rather than name prefix.
pub const MANAGED_LABEL: &str = "managed";

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_count: f64,
    pub memory_bytes: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { cpu_count: 2.0, memory_bytes: 2 * 1024 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone)]
pub struct RunBacktestParams {
    pub job_id: Uuid,
    pub strategy_name: String,
    pub strategy_code: String,
    pub config: BacktestConfig,
    pub base_config_template: Value,
    /// Present only for exchanges configured in futures mode; drives the
    /// `BASE/QUOTE` -> `BASE/QUOTE:QUOTE` pair rewrite.
    pub exchange_trading_mode: Option<String>,
    pub strategy_class_env: String,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn run_backtest(&self, params: RunBacktestParams) -> Result<String, ContainerError>;
    async fn wait_container(&self, id: &str) -> Result<(i64, String), ContainerError>;
    async fn stop_container(&self, id: &str) -> Result<(), ContainerError>;
    async fn remove_container(&self, id: &str) -> Result<(), ContainerError>;
    async fn get_container_logs(&self, id: &str) -> Result<String, ContainerError>;
    async fn is_container_running(&self, id: &str) -> Result<bool, ContainerError>;
    async fn cleanup_stale_containers(&self, max_age: Duration) -> Result<usize, ContainerError>;
    async fn validate_strategy(
        &self,
        code: &str,
        name: &str,
    ) -> Result<ValidationVerdict, ContainerError>;
}

/// Production `ContainerManager` backed by the Docker Engine API.
///
/// Owns a `tempfile::TempDir` per in-flight container, keyed by container
/// id, so the strategy file and merged config file survive from
/// `run_backtest` through `wait_container` and are released the moment the
/// container is removed — whichever code path gets there first.
pub struct DockerContainerManager {
    docker: Docker,
    image: String,
    data_mount_path: PathBuf,
    network: Option<String>,
    validator_image: Option<String>,
    temp_dirs: Mutex<StdHashMap<String, TempDir>>,
}

impl DockerContainerManager {
    pub fn new(
        docker: Docker,
        image: impl Into<String>,
        data_mount_path: PathBuf,
        network: Option<String>,
        validator_image: Option<String>,
    ) -> Self {
        Self {
            docker,
            image: image.into(),
            data_mount_path,
            network,
            validator_image,
            temp_dirs: Mutex::new(StdHashMap::new()),
        }
    }

    pub fn connect_from_env() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()?;
        let image = std::env::var("BT_DOCKER_IMAGE").unwrap_or_else(|_| "freqtrade/freqtrade:stable".into());
        let data_mount_path = std::env::var("BT_DOCKER_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/bt-engine/data"));
        let network = std::env::var("BT_DOCKER_NETWORK").ok();
        Ok(Self::new(docker, image, data_mount_path, network, None))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image, "image not present locally, pulling");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions { from_image: image, ..Default::default() }),
            None,
            None,
        );
        while let Some(progress) = stream.try_next().await? {
            if let Some(err) = progress.error {
                return Err(ContainerError::StartFailed(format!("image pull failed: {err}")));
            }
        }
        Ok(())
    }

    fn write_inputs(
        &self,
        params: &RunBacktestParams,
    ) -> Result<(TempDir, PathBuf, PathBuf), ContainerError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("bt-job-{}-", params.job_id))
            .tempdir()?;

        let strategy_path = dir.path().join(format!("{}.py", params.strategy_name));
        let mut strategy_file = std::fs::File::create(&strategy_path)?;
        strategy_file.write_all(params.strategy_code.as_bytes())?;

        let merged_config = merge_base_template(
            &params.base_config_template,
            &params.config,
            params.exchange_trading_mode.as_deref(),
        );
        let config_path = dir.path().join("config.json");
        let mut config_file = std::fs::File::create(&config_path)?;
        config_file.write_all(serde_json::to_string_pretty(&merged_config)?.as_bytes())?;

        Ok((dir, strategy_path, config_path))
    }
}

#[async_trait]
impl ContainerManager for DockerContainerManager {
    async fn run_backtest(&self, params: RunBacktestParams) -> Result<String, ContainerError> {
        self.ensure_image(&self.image).await?;

        let (temp_dir, strategy_path, config_path) = self.write_inputs(&params)?;

        let strategy_mount = "/freqtrade/user_data/strategies/strategy.py";
        let config_mount = "/freqtrade/user_data/config.json";
        let binds = vec![
            format!("{}:{}:ro", strategy_path.display(), strategy_mount),
            format!("{}:{}:ro", config_path.display(), config_mount),
            format!("{}:/freqtrade/user_data/data:ro", self.data_mount_path.display()),
        ];

        let entry_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "freqtrade download-data --config {config_mount} --timerange \"$TIMERANGE\" \
                 && freqtrade backtesting --config {config_mount} --strategy-path \
                 /freqtrade/user_data/strategies --strategy \"$STRATEGY_CLASS\""
            ),
        ];

        let mut labels = StdHashMap::new();
        labels.insert("job_id".to_string(), params.job_id.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let env = vec![
            format!("STRATEGY_CLASS={}", params.strategy_class_env),
            format!(
                "TIMERANGE={}-{}",
                params.config.timerange_start.format("%Y%m%d"),
                params.config.timerange_end.format("%Y%m%d"),
            ),
        ];

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(params.limits.memory_bytes),
            nano_cpus: Some((params.limits.cpu_count * 1_000_000_000.0) as i64),
            network_mode: self.network.clone(),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.image.clone()),
            cmd: Some(entry_cmd),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("bt-job-{}", params.job_id);
        let created = self
            .docker
            .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), container_config)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        self.temp_dirs.lock().insert(created.id.clone(), temp_dir);
        Ok(created.id)
    }

    async fn wait_container(&self, id: &str) -> Result<(i64, String), ContainerError> {
        let mut wait_stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions { condition: "not-running" }),
        );
        // `wait_container` resolves once, carrying the exit code; a
        // non-terminating stream here means the daemon connection dropped.
        let exit_code = match wait_stream.try_next().await {
            Ok(Some(result)) => result.status_code,
            Ok(None) => return Err(ContainerError::DaemonError("wait stream ended with no result".into())),
            Err(e) => {
                // bollard surfaces a non-zero exit as an Err variant carrying
                // the same status code payload; recover it rather than
                // treating every such error as infrastructural.
                if let Some(code) = extract_exit_code_from_error(&e) {
                    code
                } else {
                    return Err(ContainerError::from(e));
                }
            }
        };

        let combined = self.get_container_logs(id).await?;
        Ok((exit_code, combined))
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerError> {
        let result = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(ContainerError::from(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerError> {
        let result = self
            .docker
            .remove_container(id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;
        self.temp_dirs.lock().remove(id);
        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(ContainerError::from(e)),
        }
    }

    async fn get_container_logs(&self, id: &str) -> Result<String, ContainerError> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                timestamps: false,
                ..Default::default()
            }),
        );

        let mut combined = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            match chunk {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    combined.extend_from_slice(&message);
                }
                LogOutput::Console { message } => combined.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(String::from_utf8_lossy(&combined).into_owned())
    }

    async fn is_container_running(&self, id: &str) -> Result<bool, ContainerError> {
        let inspect = self.docker.inspect_container(id, None).await;
        match inspect {
            Ok(details) => Ok(details.state.and_then(|s| s.running).unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Err(ContainerError::NotFound(id.to_string()))
            }
            Err(e) => Err(ContainerError::from(e)),
        }
    }

    async fn cleanup_stale_containers(&self, max_age: Duration) -> Result<usize, ContainerError> {
        let mut filters = StdHashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let containers = self
            .docker
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id.clone() else { continue };
            let created_at = container
                .created
                .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0));
            let Some(created_at) = created_at else { continue };
            if created_at >= cutoff {
                continue;
            }
            // Best-effort: one failing removal must not abort the sweep
            // for the rest.
            match self.remove_container(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container_id = %id, error = %e, "failed to remove stale container"),
            }
        }
        Ok(removed)
    }

    async fn validate_strategy(
        &self,
        code: &str,
        name: &str,
    ) -> Result<ValidationVerdict, ContainerError> {
        let Some(validator_image) = self.validator_image.clone() else {
            return Ok(ValidationVerdict { valid: true, errors: Vec::new(), warnings: Vec::new() });
        };

        let dir = tempfile::Builder::new().prefix("bt-validate-").tempdir()?;
        let strategy_path = dir.path().join(format!("{name}.py"));
        std::fs::File::create(&strategy_path)?.write_all(code.as_bytes())?;

        let mount = format!("{}:/strategy/{name}.py:ro", strategy_path.display());
        let config = Config {
            image: Some(validator_image.clone()),
            host_config: Some(HostConfig { binds: Some(vec![mount]), ..Default::default() }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Option::<CreateContainerOptions<String>>::None, config)
            .await?;
        self.docker.start_container::<String>(&created.id, None).await?;

        let timeout = tokio::time::timeout(Duration::from_secs(30), async {
            self.wait_container(&created.id).await
        });
        let result = match timeout.await {
            Ok(result) => result,
            Err(_) => {
                let _ = self.stop_container(&created.id).await;
                let _ = self.remove_container(&created.id).await;
                return Err(ContainerError::StartFailed("strategy validation timed out".into()));
            }
        };
        let _ = self.remove_container(&created.id).await;

        let (_, output) = result?;
        serde_json::from_str(output.trim())
            .map_err(|e| ContainerError::InvalidConfig(format!("validator produced non-JSON output: {e}")))
    }
}

fn extract_exit_code_from_error(err: &bollard::errors::Error) -> Option<i64> {
    // bollard's wait endpoint occasionally reports a non-zero exit through
    // the server-error path rather than a success payload, depending on
    // daemon version; fall back to treating it as an infrastructural error
    // when the body doesn't carry a recognizable status code.
    if let bollard::errors::Error::DockerResponseServerError { message, .. } = err {
        message.split("exit code ").nth(1)?.trim().parse().ok()
    } else {
        None
    }
}
