//! Turns raw container output into a `BacktestResult`.

use bt_core::{BacktestResult, PairBreakdown};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::compress::compress_raw_log;
use crate::error::ParseError;
use crate::patterns;

/// Characters kept from the error-signature match onward.
pub const ERROR_SNIPPET_LEN: usize = 500;

/// Parses `output` into a `BacktestResult` for `job_id`/`strategy_id`.
///
/// Returns `Err(ParseError::StrategyCodeError)` if a known error signature
/// is found before any metric extraction is attempted — a non-zero exit
/// with recognizable Python traceback noise never gets treated as a
/// (possibly inconsistent) successful parse.
pub fn parse_backtest_output(
    output: &str,
    job_id: Uuid,
    strategy_id: Uuid,
    now: DateTime<Utc>,
) -> Result<BacktestResult, ParseError> {
    if let Some(idx) = patterns::find_error_signature(output) {
        let mut end = (idx + ERROR_SNIPPET_LEN).min(output.len());
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        return Err(ParseError::StrategyCodeError(output[idx..end].to_string()));
    }

    let total_trades = patterns::extract_total_trades(output).unwrap_or(0);
    let (win_rate, winning_trades, losing_trades) =
        patterns::extract_win_rate(output).unwrap_or((0.0, 0, 0));
    let (profit_total, profit_pct) = patterns::extract_total_profit(output).unwrap_or((0.0, 0.0));
    let (max_drawdown_abs, max_drawdown_pct) =
        patterns::extract_max_drawdown(output).unwrap_or((0.0, 0.0));

    let pair_breakdown = patterns::extract_pair_breakdown(output)
        .into_iter()
        .map(|(pair, trades, profit_pct, profit_abs)| PairBreakdown { pair, trades, profit_pct, profit_abs })
        .collect();

    let raw_log_compressed = compress_raw_log(output).map_err(|e| ParseError::Compression(e.to_string()))?;

    let result = BacktestResult {
        id: Uuid::new_v4(),
        job_id,
        strategy_id,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        profit_total,
        profit_pct,
        max_drawdown_abs,
        max_drawdown_pct,
        sharpe_ratio: patterns::extract_sharpe_ratio(output),
        sortino_ratio: patterns::extract_sortino_ratio(output),
        profit_factor: patterns::extract_profit_factor(output),
        best_trade_pct: patterns::extract_best_trade_pct(output),
        worst_trade_pct: patterns::extract_worst_trade_pct(output),
        avg_trade_duration_minutes: patterns::extract_avg_trade_duration_minutes(output),
        pair_breakdown,
        raw_log_compressed,
        created_at: now,
    };

    if !result.is_internally_consistent() {
        return Err(ParseError::Inconsistent(format!(
            "total_trades=0 but profit fields are non-zero (job {job_id})"
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_PATH_OUTPUT: &str = "\
=========================================================== BACKTESTING REPORT ===========================================================
|      Pair |   Trades |   Avg Profit % |   Tot Profit USDT |
|-----------+----------+----------------+--------------------|
|  BTC/USDT |        8 |           3.10 |             180.00 |
|  ETH/USDT |        4 |           1.50 |             120.00 |
|     TOTAL |       12 |           2.50 |             300.00 |

Total trades: 12
Win Rate: 83.3% (10 wins, 2 losses)
Total profit: 300.00 USDT (4.25%)
Max Drawdown: 50.00 USDT (5.00%)
Profit Factor: 2.5
Best Trade: 8.20%
Worst Trade: -3.10%
Avg Trade Duration: 90.0 min
Sharpe Ratio: 1.8
Sortino Ratio: 2.1
";

    #[test]
    fn happy_path_parse() {
        let result =
            parse_backtest_output(HAPPY_PATH_OUTPUT, Uuid::new_v4(), Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(result.total_trades, 12);
        assert_eq!(result.profit_pct, 4.25);
        assert_eq!(result.sharpe_ratio, Some(1.8));
        assert_eq!(result.pair_breakdown.len(), 2);
    }

    #[test]
    fn error_signature_short_circuits_metric_extraction() {
        let output = "Traceback (most recent call last):\nNameError: name 'foo' is not defined";
        let err = parse_backtest_output(output, Uuid::new_v4(), Uuid::new_v4(), Utc::now()).unwrap_err();
        match err {
            ParseError::StrategyCodeError(msg) => {
                assert!(msg.starts_with("Traceback (most recent call last)"));
            }
            other => panic!("expected StrategyCodeError, got {other:?}"),
        }
    }

    #[test]
    fn zero_trades_with_fabricated_profit_is_rejected() {
        // Total trades is absent (defaults to 0) but a profit line is
        // present anyway — a malformed / partial capture, not a faithful
        // zero-trade run.
        let output = "Total profit: 50.00 USDT (5.00%)";
        let err = parse_backtest_output(output, Uuid::new_v4(), Uuid::new_v4(), Utc::now()).unwrap_err();
        assert!(matches!(err, ParseError::Inconsistent(_)));
    }

    #[test]
    fn genuinely_empty_run_is_accepted() {
        let output = "Total trades: 0\nNo trades made.";
        let result =
            parse_backtest_output(output, Uuid::new_v4(), Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.profit_total, 0.0);
    }

    #[test]
    fn missing_optional_ratios_stay_unset() {
        let output = "Total trades: 3\nWin Rate: 66.6% (2 wins, 1 losses)\nTotal profit: 10.00 USDT (1.00%)";
        let result =
            parse_backtest_output(output, Uuid::new_v4(), Uuid::new_v4(), Utc::now()).unwrap();
        assert_eq!(result.sharpe_ratio, None);
        assert_eq!(result.sortino_ratio, None);
        assert_eq!(result.profit_factor, None);
    }
}
