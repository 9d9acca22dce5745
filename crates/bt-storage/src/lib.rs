//! bt-storage: the durable job repository — the sole mutator of persisted
//! state. Everything else reaches the database only through the
//! `Repository` trait; `PgRepository` is the production implementation.

pub mod error;
pub mod pg;
pub mod repository;

pub use error::RepoError;
pub use pg::{connect, connect_from_env, migrate, PgRepository, ENV_DB_URL};
pub use repository::{JobFilter, QueueStats, Repository, ResultFilter};
