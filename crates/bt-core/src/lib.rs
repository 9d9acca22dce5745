//! bt-core: domain types shared by every other crate in the workspace.
//!
//! Deliberately free of I/O dependencies (no sqlx, no tokio) so it can be
//! pulled into any crate — storage, container manager, engine, daemon —
//! without dragging in a runtime or a database driver.

pub mod error;
pub mod event;
pub mod job;
pub mod optimization;
pub mod result;
pub mod scout;
pub mod strategy;

pub use error::BtError;
pub use event::{Envelope, Event};
pub use job::{BacktestConfig, BacktestJob, JobStatus};
pub use optimization::{
    IterationApproval, ObjectiveMode, OptimizationIteration, OptimizationRun, OptimizationStatus,
};
pub use result::{BacktestResult, PairBreakdown};
pub use scout::{ScoutRun, ScoutRunStatus, ScoutSchedule, TriggerType};
pub use strategy::Strategy;
