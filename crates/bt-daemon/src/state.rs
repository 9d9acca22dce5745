//! Shared runtime state for bt-daemon.
//!
//! All handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself beyond the `Arc`/`CancellationToken` plumbing.

use std::sync::Arc;
use std::time::Instant;

use bt_container::ContainerManager;
use bt_events::Publisher;
use bt_storage::Repository;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Static build metadata included in the health response.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub containers: Arc<dyn ContainerManager>,
    pub publisher: Arc<dyn Publisher>,
    pub build: BuildInfo,
    pub started_at: Instant,
    /// Shared with the worker pool, dispatcher, and cron scheduler; cancelling
    /// it is how `main.rs` initiates graceful shutdown.
    pub root: CancellationToken,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn Repository>,
        containers: Arc<dyn ContainerManager>,
        publisher: Arc<dyn Publisher>,
        root: CancellationToken,
    ) -> Self {
        Self {
            repo,
            containers,
            publisher,
            build: BuildInfo { service: "bt-daemon", version: env!("CARGO_PKG_VERSION") },
            started_at: Instant::now(),
            root,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
