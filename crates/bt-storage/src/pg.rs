//! `PgRepository`: the production `Repository` implementation over
//! PostgreSQL. Every query here follows a free-function-plus-`row.try_get`
//! row-conversion style, with one structural departure: methods hang off a
//! struct implementing the object-safe `Repository` trait instead of being
//! free functions, so `bt-engine` can hold a `Arc<dyn Repository>`.

use std::str::FromStr;

use async_trait::async_trait;
use bt_core::{
    BacktestConfig, BacktestJob, BacktestResult, IterationApproval, JobStatus,
    ObjectiveMode, OptimizationIteration, OptimizationRun, OptimizationStatus, PairBreakdown,
    ScoutRun, ScoutRunStatus, ScoutSchedule, Strategy, TriggerType,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::error::RepoError;
use crate::repository::{JobFilter, QueueStats, Repository, ResultFilter};

pub const ENV_DB_URL: &str = "BT_DATABASE_URL";

pub async fn connect_from_env() -> Result<PgPool, RepoError> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| RepoError::Validation(format!("missing env var {ENV_DB_URL}")))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool, RepoError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .map_err(RepoError::from)
}

pub async fn migrate(pool: &PgPool) -> Result<(), RepoError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| RepoError::Database(sqlx::Error::Migrate(Box::new(e))))
}

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row -> domain-type conversions
// ---------------------------------------------------------------------------

fn strategy_from_row(row: &sqlx::postgres::PgRow) -> Result<Strategy, RepoError> {
    Ok(Strategy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        code_hash: row.try_get("code_hash")?,
        parent_id: row.try_get("parent_id")?,
        generation: row.try_get("generation")?,
        description: row.try_get("description")?,
        tags: row.try_get("tags")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn job_status_from_str(s: &str) -> Result<JobStatus, RepoError> {
    JobStatus::from_str(s).map_err(RepoError::Validation)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<BacktestJob, RepoError> {
    let config_json: Value = row.try_get("config")?;
    let config: BacktestConfig = serde_json::from_value(config_json)
        .map_err(|e| RepoError::Validation(format!("malformed stored config: {e}")))?;
    let status: String = row.try_get("status")?;
    Ok(BacktestJob {
        id: row.try_get("id")?,
        strategy_id: row.try_get("strategy_id")?,
        optimization_run_id: row.try_get("optimization_run_id")?,
        config,
        priority: row.try_get("priority")?,
        status: job_status_from_str(&status)?,
        container_id: row.try_get("container_id")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn result_from_row(row: &sqlx::postgres::PgRow) -> Result<BacktestResult, RepoError> {
    Ok(BacktestResult {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        strategy_id: row.try_get("strategy_id")?,
        total_trades: row.try_get("total_trades")?,
        winning_trades: row.try_get("winning_trades")?,
        losing_trades: row.try_get("losing_trades")?,
        win_rate: row.try_get("win_rate")?,
        profit_total: row.try_get("profit_total")?,
        profit_pct: row.try_get("profit_pct")?,
        max_drawdown_abs: row.try_get("max_drawdown_abs")?,
        max_drawdown_pct: row.try_get("max_drawdown_pct")?,
        sharpe_ratio: row.try_get("sharpe_ratio")?,
        sortino_ratio: row.try_get("sortino_ratio")?,
        profit_factor: row.try_get("profit_factor")?,
        best_trade_pct: row.try_get("best_trade_pct")?,
        worst_trade_pct: row.try_get("worst_trade_pct")?,
        avg_trade_duration_minutes: row.try_get("avg_trade_duration_minutes")?,
        pair_breakdown: Vec::new(), // filled in by the caller via `load_pair_breakdown`
        raw_log_compressed: row.try_get("raw_log_compressed")?,
        created_at: row.try_get("created_at")?,
    })
}

fn objective_from_str(s: &str) -> Result<ObjectiveMode, RepoError> {
    match s {
        "maximize_sharpe" => Ok(ObjectiveMode::MaximizeSharpe),
        "maximize_profit" => Ok(ObjectiveMode::MaximizeProfit),
        "minimize_drawdown" => Ok(ObjectiveMode::MinimizeDrawdown),
        "composite" => Ok(ObjectiveMode::Composite),
        other => Err(RepoError::Validation(format!("unknown objective '{other}'"))),
    }
}

fn objective_as_str(o: ObjectiveMode) -> &'static str {
    match o {
        ObjectiveMode::MaximizeSharpe => "maximize_sharpe",
        ObjectiveMode::MaximizeProfit => "maximize_profit",
        ObjectiveMode::MinimizeDrawdown => "minimize_drawdown",
        ObjectiveMode::Composite => "composite",
    }
}

fn optimization_status_from_str(s: &str) -> Result<OptimizationStatus, RepoError> {
    match s {
        "pending" => Ok(OptimizationStatus::Pending),
        "running" => Ok(OptimizationStatus::Running),
        "paused" => Ok(OptimizationStatus::Paused),
        "completed" => Ok(OptimizationStatus::Completed),
        "failed" => Ok(OptimizationStatus::Failed),
        "cancelled" => Ok(OptimizationStatus::Cancelled),
        other => Err(RepoError::Validation(format!("unknown optimization status '{other}'"))),
    }
}

fn optimization_status_as_str(s: OptimizationStatus) -> &'static str {
    match s {
        OptimizationStatus::Pending => "pending",
        OptimizationStatus::Running => "running",
        OptimizationStatus::Paused => "paused",
        OptimizationStatus::Completed => "completed",
        OptimizationStatus::Failed => "failed",
        OptimizationStatus::Cancelled => "cancelled",
    }
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<OptimizationRun, RepoError> {
    let config_json: Value = row.try_get("config")?;
    let config: BacktestConfig = serde_json::from_value(config_json)
        .map_err(|e| RepoError::Validation(format!("malformed stored config: {e}")))?;
    let objective: String = row.try_get("objective")?;
    let status: String = row.try_get("status")?;
    Ok(OptimizationRun {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        base_strategy_id: row.try_get("base_strategy_id")?,
        config,
        objective: objective_from_str(&objective)?,
        status: optimization_status_from_str(&status)?,
        current_iteration: row.try_get("current_iteration")?,
        max_iterations: row.try_get("max_iterations")?,
        best_strategy_id: row.try_get("best_strategy_id")?,
        best_result_id: row.try_get("best_result_id")?,
        termination_reason: row.try_get("termination_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn approval_from_str(s: &str) -> Result<IterationApproval, RepoError> {
    match s {
        "pending" => Ok(IterationApproval::Pending),
        "approved" => Ok(IterationApproval::Approved),
        "rejected" => Ok(IterationApproval::Rejected),
        "needs_iteration" => Ok(IterationApproval::NeedsIteration),
        other => Err(RepoError::Validation(format!("unknown approval '{other}'"))),
    }
}

fn approval_as_str(a: IterationApproval) -> &'static str {
    match a {
        IterationApproval::Pending => "pending",
        IterationApproval::Approved => "approved",
        IterationApproval::Rejected => "rejected",
        IterationApproval::NeedsIteration => "needs_iteration",
    }
}

fn iteration_from_row(row: &sqlx::postgres::PgRow) -> Result<OptimizationIteration, RepoError> {
    let approval: String = row.try_get("approval")?;
    Ok(OptimizationIteration {
        id: row.try_get("id")?,
        optimization_run_id: row.try_get("optimization_run_id")?,
        iteration_number: row.try_get("iteration_number")?,
        strategy_id: row.try_get("strategy_id")?,
        backtest_job_id: row.try_get("backtest_job_id")?,
        result_id: row.try_get("result_id")?,
        agent_notes: row.try_get("agent_notes")?,
        approval: approval_from_str(&approval)?,
        created_at: row.try_get("created_at")?,
    })
}

fn schedule_from_row(row: &sqlx::postgres::PgRow) -> Result<ScoutSchedule, RepoError> {
    Ok(ScoutSchedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        source: row.try_get("source")?,
        max_strategies: row.try_get("max_strategies")?,
        enabled: row.try_get("enabled")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trigger_type_as_str(t: TriggerType) -> &'static str {
    match t {
        TriggerType::Scheduled => "scheduled",
        TriggerType::Manual => "manual",
    }
}

fn scout_status_as_str(s: ScoutRunStatus) -> &'static str {
    match s {
        ScoutRunStatus::Pending => "pending",
        ScoutRunStatus::Running => "running",
        ScoutRunStatus::Completed => "completed",
        ScoutRunStatus::Failed => "failed",
    }
}

impl PgRepository {
    async fn load_pair_breakdown(&self, result_id: Uuid) -> Result<Vec<PairBreakdown>, RepoError> {
        let rows = sqlx::query(
            r#"
            select pair, trades, profit_pct, profit_abs
            from backtest_result_pairs
            where result_id = $1
            order by ord asc
            "#,
        )
        .bind(result_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PairBreakdown {
                    pair: row.try_get("pair")?,
                    trades: row.try_get("trades")?,
                    profit_pct: row.try_get("profit_pct")?,
                    profit_abs: row.try_get("profit_abs")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Repository for PgRepository {
    // --- Strategies ---

    async fn create_strategy(&self, strategy: &Strategy) -> Result<(), RepoError> {
        let existing = sqlx::query("select 1 from strategies where code_hash = $1")
            .bind(&strategy.code_hash)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(RepoError::Conflict(format!(
                "strategy with code_hash {} already exists",
                strategy.code_hash
            )));
        }

        sqlx::query(
            r#"
            insert into strategies (
                id, name, code, code_hash, parent_id, generation,
                description, tags, metadata, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(strategy.id)
        .bind(&strategy.name)
        .bind(&strategy.code)
        .bind(&strategy.code_hash)
        .bind(strategy.parent_id)
        .bind(strategy.generation)
        .bind(&strategy.description)
        .bind(&strategy.tags)
        .bind(&strategy.metadata)
        .bind(strategy.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_strategy(&self, id: Uuid) -> Result<Strategy, RepoError> {
        let row = sqlx::query("select * from strategies where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("strategy {id} not found")))?;
        strategy_from_row(&row)
    }

    async fn get_strategy_by_hash(&self, code_hash: &str) -> Result<Option<Strategy>, RepoError> {
        let row = sqlx::query("select * from strategies where code_hash = $1")
            .bind(code_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(strategy_from_row).transpose()
    }

    async fn delete_strategy(&self, id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query("delete from strategies where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("strategy {id} not found")));
        }
        Ok(())
    }

    // --- Jobs ---

    async fn create_job(&self, job: &BacktestJob) -> Result<(), RepoError> {
        job.config
            .validate()
            .map_err(RepoError::Validation)?;
        let config_json = serde_json::to_value(&job.config)
            .map_err(|e| RepoError::Validation(e.to_string()))?;
        sqlx::query(
            r#"
            insert into backtest_jobs (
                id, strategy_id, optimization_run_id, config, priority, status,
                container_id, error_message, retry_count, created_at, started_at, completed_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(job.strategy_id)
        .bind(job.optimization_run_id)
        .bind(config_json)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(&job.container_id)
        .bind(&job.error_message)
        .bind(job.retry_count)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_jobs_batch(&self, jobs: &[BacktestJob]) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            job.config.validate().map_err(RepoError::Validation)?;
            let config_json = serde_json::to_value(&job.config)
                .map_err(|e| RepoError::Validation(e.to_string()))?;
            sqlx::query(
                r#"
                insert into backtest_jobs (
                    id, strategy_id, optimization_run_id, config, priority, status,
                    container_id, error_message, retry_count, created_at, started_at, completed_at
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(job.id)
            .bind(job.strategy_id)
            .bind(job.optimization_run_id)
            .bind(config_json)
            .bind(job.priority)
            .bind(job.status.as_str())
            .bind(&job.container_id)
            .bind(&job.error_message)
            .bind(job.retry_count)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<BacktestJob, RepoError> {
        let row = sqlx::query("select * from backtest_jobs where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("job {id} not found")))?;
        job_from_row(&row)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<BacktestJob>, RepoError> {
        let mut qb = sqlx::QueryBuilder::new("select * from backtest_jobs where 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" and status = ").push_bind(status.as_str());
        }
        if let Some(strategy_id) = filter.strategy_id {
            qb.push(" and strategy_id = ").push_bind(strategy_id);
        }
        if let Some(run_id) = filter.optimization_run_id {
            qb.push(" and optimization_run_id = ").push_bind(run_id);
        }
        if let Some(after) = filter.created_after {
            qb.push(" and created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" and created_at <= ").push_bind(before);
        }
        qb.push(" order by priority desc, created_at asc limit ")
            .push_bind(filter.limit.max(1))
            .push(" offset ")
            .push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_pending_jobs(&self, limit: i64) -> Result<Vec<BacktestJob>, RepoError> {
        // The claim has to be a single statement, not a SELECT ... FOR
        // UPDATE SKIP LOCKED followed by a separate UPDATE: the row lock
        // from a bare SELECT is released the moment this query's implicit
        // transaction ends, which is before the caller gets a chance to
        // call `mark_running`. Folding the claim and the pending -> running
        // transition into one `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP
        // LOCKED)` closes that window, mirroring the outbox claim idiom.
        let rows = sqlx::query(
            r#"
            with claimed as (
                select id
                from backtest_jobs
                where status = 'pending'
                order by priority desc, created_at asc
                limit $1
                for update skip locked
            )
            update backtest_jobs
            set status = 'running', started_at = now()
            from claimed
            where backtest_jobs.id = claimed.id
            returning backtest_jobs.*
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_running(
        &self,
        id: Uuid,
        expected_prev_status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update backtest_jobs
            set status = 'running', started_at = $3
            where id = $1 and status = $2
            returning id
            "#,
        )
        .bind(id)
        .bind(expected_prev_status.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ()).ok_or_else(|| {
            RepoError::Conflict(format!(
                "job {id} is not in expected status {}",
                expected_prev_status.as_str()
            ))
        })
    }

    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update backtest_jobs
            set status = 'completed', completed_at = $2
            where id = $1 and status = 'running'
            returning id
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ())
            .ok_or_else(|| RepoError::Conflict(format!("job {id} is not running")))
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update backtest_jobs
            set status = 'failed', error_message = $2, completed_at = $3
            where id = $1 and status = 'running'
            returning id
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ())
            .ok_or_else(|| RepoError::Conflict(format!("job {id} is not running")))
    }

    async fn cancel_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), RepoError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            update backtest_jobs
            set status = 'cancelled', completed_at = $2
            where id = $1 and status in ('pending', 'running')
            returning id
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|_| ())
            .ok_or_else(|| RepoError::Conflict(format!("job {id} is not cancellable")))
    }

    async fn increment_retry_count(&self, id: Uuid) -> Result<i32, RepoError> {
        let row: (i32,) = sqlx::query_as(
            r#"
            update backtest_jobs
            set retry_count = retry_count + 1
            where id = $1
            returning retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepoError::NotFound(format!("job {id} not found")))?;
        Ok(row.0)
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        container_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            update backtest_jobs
            set status = $2,
                container_id = coalesce($3, container_id),
                error_message = coalesce($4, error_message)
            where id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(container_id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("job {id} not found")));
        }
        Ok(())
    }

    async fn get_timed_out_jobs(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<BacktestJob>, RepoError> {
        let cutoff = now - max_age;
        let rows = sqlx::query(
            r#"
            select * from backtest_jobs
            where status = 'running' and started_at < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, RepoError> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc();

        let row = sqlx::query(
            r#"
            select
                count(*) filter (where status = 'pending') as pending,
                count(*) filter (where status = 'running') as running,
                count(*) filter (where status = 'completed') as completed,
                count(*) filter (where status = 'failed') as failed,
                count(*) filter (where status = 'cancelled') as cancelled,
                count(*) filter (where status = 'completed' and completed_at >= $1) as completed_today,
                count(*) filter (where status = 'failed' and completed_at >= $1) as failed_today
            from backtest_jobs
            "#,
        )
        .bind(day_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
            completed_today: row.try_get("completed_today")?,
            failed_today: row.try_get("failed_today")?,
        })
    }

    // --- Results ---

    async fn create_result(&self, result: &BacktestResult) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            insert into backtest_results (
                id, job_id, strategy_id, total_trades, winning_trades, losing_trades,
                win_rate, profit_total, profit_pct, max_drawdown_abs, max_drawdown_pct,
                sharpe_ratio, sortino_ratio, profit_factor, best_trade_pct, worst_trade_pct,
                avg_trade_duration_minutes, raw_log_compressed, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(result.id)
        .bind(result.job_id)
        .bind(result.strategy_id)
        .bind(result.total_trades)
        .bind(result.winning_trades)
        .bind(result.losing_trades)
        .bind(result.win_rate)
        .bind(result.profit_total)
        .bind(result.profit_pct)
        .bind(result.max_drawdown_abs)
        .bind(result.max_drawdown_pct)
        .bind(result.sharpe_ratio)
        .bind(result.sortino_ratio)
        .bind(result.profit_factor)
        .bind(result.best_trade_pct)
        .bind(result.worst_trade_pct)
        .bind(result.avg_trade_duration_minutes)
        .bind(&result.raw_log_compressed)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await?;

        for (ord, pair) in result.pair_breakdown.iter().enumerate() {
            sqlx::query(
                r#"
                insert into backtest_result_pairs (result_id, pair, trades, profit_pct, profit_abs, ord)
                values ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(result.id)
            .bind(&pair.pair)
            .bind(pair.trades)
            .bind(pair.profit_pct)
            .bind(pair.profit_abs)
            .bind(ord as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<BacktestResult, RepoError> {
        let row = sqlx::query("select * from backtest_results where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("result {id} not found")))?;
        let mut result = result_from_row(&row)?;
        result.pair_breakdown = self.load_pair_breakdown(result.id).await?;
        Ok(result)
    }

    async fn get_result_by_job_id(&self, job_id: Uuid) -> Result<Option<BacktestResult>, RepoError> {
        let row = sqlx::query("select * from backtest_results where job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut result = result_from_row(&row)?;
        result.pair_breakdown = self.load_pair_breakdown(result.id).await?;
        Ok(Some(result))
    }

    async fn query_results(&self, filter: &ResultFilter) -> Result<Vec<BacktestResult>, RepoError> {
        let mut qb = sqlx::QueryBuilder::new("select * from backtest_results where 1 = 1");
        if let Some(strategy_id) = filter.strategy_id {
            qb.push(" and strategy_id = ").push_bind(strategy_id);
        }
        if let Some(min_profit) = filter.min_profit_pct {
            qb.push(" and profit_pct >= ").push_bind(min_profit);
        }
        if let Some(min_sharpe) = filter.min_sharpe {
            qb.push(" and sharpe_ratio >= ").push_bind(min_sharpe);
        }
        qb.push(" order by created_at desc limit ")
            .push_bind(filter.limit.max(1))
            .push(" offset ")
            .push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut result = result_from_row(row)?;
            result.pair_breakdown = self.load_pair_breakdown(result.id).await?;
            out.push(result);
        }
        Ok(out)
    }

    // --- Optimization ---

    async fn create_optimization_run(&self, run: &OptimizationRun) -> Result<(), RepoError> {
        let config_json = serde_json::to_value(&run.config)
            .map_err(|e| RepoError::Validation(e.to_string()))?;
        sqlx::query(
            r#"
            insert into optimization_runs (
                id, name, base_strategy_id, config, objective, status, current_iteration,
                max_iterations, best_strategy_id, best_result_id, termination_reason,
                created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(&run.name)
        .bind(run.base_strategy_id)
        .bind(config_json)
        .bind(objective_as_str(run.objective))
        .bind(optimization_status_as_str(run.status))
        .bind(run.current_iteration)
        .bind(run.max_iterations)
        .bind(run.best_strategy_id)
        .bind(run.best_result_id)
        .bind(&run.termination_reason)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_optimization_run(&self, id: Uuid) -> Result<OptimizationRun, RepoError> {
        let row = sqlx::query("select * from optimization_runs where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("optimization run {id} not found")))?;
        run_from_row(&row)
    }

    async fn list_optimization_runs(&self) -> Result<Vec<OptimizationRun>, RepoError> {
        let rows = sqlx::query("select * from optimization_runs order by created_at desc")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn set_optimization_status(
        &self,
        id: Uuid,
        status: OptimizationStatus,
        now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError> {
        // Guarded the same way `mark_running`/`mark_completed` guard job
        // transitions: the WHERE clause excludes terminal statuses so a
        // caller racing a just-completed/cancelled/failed run can never
        // overwrite it, instead of writing first and checking after.
        let row = sqlx::query(
            r#"
            with prev as (
                select status from optimization_runs where id = $1
            )
            update optimization_runs
            set status = $2, updated_at = $3
            where id = $1
              and status not in ('completed', 'failed', 'cancelled')
            returning (select status from prev) as previous_status
            "#,
        )
        .bind(id)
        .bind(optimization_status_as_str(status))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let previous: String = row.try_get("previous_status")?;
                optimization_status_from_str(&previous)
            }
            None => {
                // Either the run doesn't exist, or it's already terminal
                // and the guard above refused the write. Disambiguate with
                // a read so the caller still gets a precise error.
                let existing: Option<(String,)> =
                    sqlx::query_as("select status from optimization_runs where id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match existing {
                    Some((status,)) => optimization_status_from_str(&status),
                    None => Err(RepoError::NotFound(format!("optimization run {id} not found"))),
                }
            }
        }
    }

    async fn complete_optimization_run(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        termination_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OptimizationStatus, RepoError> {
        // A single UPDATE ... RETURNING the pre-update status closes a
        // read/write race: two concurrent COMPLETE calls each see their own
        // accurate "previous status" from the same round trip that performs
        // the transition, instead of a separate preceding SELECT that can
        // race against the other caller's UPDATE. The WHERE guard below is
        // what actually prevents a terminal run from being overwritten —
        // returning the previous status alone is not enough, since by the
        // time the caller inspects it the row would already be mutated.
        let row = sqlx::query(
            r#"
            with prev as (
                select status from optimization_runs where id = $1
            )
            update optimization_runs
            set status = 'completed',
                best_strategy_id = coalesce($2, best_strategy_id),
                best_result_id = coalesce($3, best_result_id),
                termination_reason = coalesce($4, termination_reason),
                updated_at = $5
            where id = $1
              and status not in ('completed', 'failed', 'cancelled')
            returning (select status from prev) as previous_status
            "#,
        )
        .bind(id)
        .bind(best_strategy_id)
        .bind(best_result_id)
        .bind(termination_reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let previous: String = row.try_get("previous_status")?;
                optimization_status_from_str(&previous)
            }
            None => {
                let existing: Option<(String,)> =
                    sqlx::query_as("select status from optimization_runs where id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match existing {
                    Some((status,)) => optimization_status_from_str(&status),
                    None => Err(RepoError::NotFound(format!("optimization run {id} not found"))),
                }
            }
        }
    }

    async fn advance_optimization_iteration(
        &self,
        id: Uuid,
        best_strategy_id: Option<Uuid>,
        best_result_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<i32, RepoError> {
        let row: (i32,) = sqlx::query_as(
            r#"
            update optimization_runs
            set current_iteration = current_iteration + 1,
                best_strategy_id = coalesce($2, best_strategy_id),
                best_result_id = coalesce($3, best_result_id),
                updated_at = $4
            where id = $1
            returning current_iteration
            "#,
        )
        .bind(id)
        .bind(best_strategy_id)
        .bind(best_result_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepoError::NotFound(format!("optimization run {id} not found")))?;
        Ok(row.0)
    }

    async fn create_iteration(&self, iteration: &OptimizationIteration) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            insert into optimization_iterations (
                id, optimization_run_id, iteration_number, strategy_id, backtest_job_id,
                result_id, agent_notes, approval, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(iteration.id)
        .bind(iteration.optimization_run_id)
        .bind(iteration.iteration_number)
        .bind(iteration.strategy_id)
        .bind(iteration.backtest_job_id)
        .bind(iteration.result_id)
        .bind(&iteration.agent_notes)
        .bind(approval_as_str(iteration.approval))
        .bind(iteration.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_iteration_by_job_id(&self, backtest_job_id: Uuid) -> Result<Option<OptimizationIteration>, RepoError> {
        let row = sqlx::query("select * from optimization_iterations where backtest_job_id = $1")
            .bind(backtest_job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| iteration_from_row(&row)).transpose()
    }

    async fn update_iteration_result(&self, id: Uuid, result_id: Uuid) -> Result<(), RepoError> {
        let result = sqlx::query(
            "update optimization_iterations set result_id = $2 where id = $1",
        )
        .bind(id)
        .bind(result_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("iteration {id} not found")));
        }
        Ok(())
    }

    async fn update_iteration_feedback(
        &self,
        id: Uuid,
        agent_notes: Option<&str>,
        approval: IterationApproval,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            update optimization_iterations
            set agent_notes = coalesce($2, agent_notes), approval = $3
            where id = $1
            "#,
        )
        .bind(id)
        .bind(agent_notes)
        .bind(approval_as_str(approval))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("iteration {id} not found")));
        }
        Ok(())
    }

    // --- Scout ---

    async fn create_scout_schedule(&self, schedule: &ScoutSchedule) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            insert into scout_schedules (
                id, name, cron_expression, source, max_strategies, enabled,
                last_run_at, next_run_at, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.source)
        .bind(schedule.max_strategies)
        .bind(schedule.enabled)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_enabled_scout_schedules(&self) -> Result<Vec<ScoutSchedule>, RepoError> {
        let rows = sqlx::query("select * from scout_schedules where enabled order by name asc")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_scout_schedule_run_times(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "update scout_schedules set last_run_at = $2, next_run_at = $3 where id = $1",
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("scout schedule {id} not found")));
        }
        Ok(())
    }

    async fn create_scout_run(&self, run: &ScoutRun) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            insert into scout_runs (
                id, schedule_id, trigger_type, triggered_by, source, max_strategies,
                status, error_message, metrics, created_at, completed_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(run.schedule_id)
        .bind(trigger_type_as_str(run.trigger_type))
        .bind(&run.triggered_by)
        .bind(&run.source)
        .bind(run.max_strategies)
        .bind(scout_status_as_str(run.status))
        .bind(&run.error_message)
        .bind(&run.metrics)
        .bind(run.created_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_scout_run_status(
        &self,
        id: Uuid,
        status: ScoutRunStatus,
        error_message: Option<&str>,
        metrics: Value,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            update scout_runs
            set status = $2, error_message = coalesce($3, error_message),
                metrics = $4, completed_at = coalesce($5, completed_at)
            where id = $1
            "#,
        )
        .bind(id)
        .bind(scout_status_as_str(status))
        .bind(error_message)
        .bind(metrics)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("scout run {id} not found")));
        }
        Ok(())
    }
}
