//! bt-container: the Container Manager — materializes strategy code and a
//! merged runtime config into a sandboxed Docker container, waits on it, and
//! tears it down on every exit path.

pub mod config_merge;
pub mod error;
pub mod fake;
pub mod manager;

pub use config_merge::{merge_base_template, rewrite_futures_pair, ConfigValue};
pub use error::ContainerError;
pub use fake::{FakeContainerManager, ScriptedOutcome};
pub use manager::{
    ContainerManager, DockerContainerManager, ResourceLimits, RunBacktestParams, ValidationVerdict,
    MANAGED_LABEL, TAIL_BYTES,
};
