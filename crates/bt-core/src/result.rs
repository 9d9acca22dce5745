//! BacktestResult entity: the metrics a completed job produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per trading pair in a multi-pair run, extracted from a repeating
/// line pattern in the container's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairBreakdown {
    pub pair: String,
    pub trades: i32,
    pub profit_pct: f64,
    pub profit_abs: f64,
}

/// Exists only when the producing job is in state `completed` — enforced at
/// the repository boundary by the unique `job_id` foreign key and the
/// worker only ever inserting a result alongside a `MarkCompleted` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub strategy_id: Uuid,
    pub total_trades: i32,
    pub winning_trades: i32,
    pub losing_trades: i32,
    pub win_rate: f64,
    pub profit_total: f64,
    pub profit_pct: f64,
    pub max_drawdown_abs: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub profit_factor: Option<f64>,
    pub best_trade_pct: Option<f64>,
    pub worst_trade_pct: Option<f64>,
    pub avg_trade_duration_minutes: Option<f64>,
    pub pair_breakdown: Vec<PairBreakdown>,
    /// Compressed raw container output. Stored so a parsing bug can be
    /// fixed and the result reparsed from source without rerunning the
    /// backtest.
    pub raw_log_compressed: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl BacktestResult {
    /// A zero-trade run must report zero on every profit-derived field;
    /// a non-zero profit field alongside zero trades is never a faithful
    /// parse and is rejected before persistence.
    pub fn is_internally_consistent(&self) -> bool {
        if self.total_trades != 0 {
            return true;
        }
        self.winning_trades == 0
            && self.losing_trades == 0
            && self.profit_total == 0.0
            && self.profit_pct == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(total_trades: i32) -> BacktestResult {
        BacktestResult {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            strategy_id: Uuid::new_v4(),
            total_trades,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            profit_total: 0.0,
            profit_pct: 0.0,
            max_drawdown_abs: 0.0,
            max_drawdown_pct: 0.0,
            sharpe_ratio: None,
            sortino_ratio: None,
            profit_factor: None,
            best_trade_pct: None,
            worst_trade_pct: None,
            avg_trade_duration_minutes: None,
            pair_breakdown: Vec::new(),
            raw_log_compressed: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn zero_trades_requires_zero_profit() {
        assert!(base(0).is_internally_consistent());

        let mut r = base(0);
        r.profit_total = 12.0;
        assert!(!r.is_internally_consistent());
    }

    #[test]
    fn non_zero_trades_is_always_consistent() {
        let mut r = base(3);
        r.profit_total = -5.0;
        assert!(r.is_internally_consistent());
    }
}
