//! Regex field extraction.
//!
//! One `LazyLock<Regex>` per metric, keeping each field's extraction
//! isolated so a single missing field degrades one metric, not the whole
//! record. Each `extract_*` function returns `None` on no match rather than
//! propagating an error — only the caller decides whether a missing
//! *required* field (total trades) makes the whole parse fail.

use std::sync::LazyLock;

use regex::Regex;

/// Literal/regex patterns checked, in order, before metric extraction. A
/// match short-circuits extraction: parsing returns a structured error
/// carrying the first 500 characters starting at the match.
pub const ERROR_SIGNATURES: &[&str] = &[
    "Error:",
    "CRITICAL:",
    "Exception:",
    "Traceback (most recent call last)",
    "Strategy file not found",
    "No data found",
    "ImportError:",
    "ModuleNotFoundError:",
    "SyntaxError:",
];

pub fn find_error_signature(output: &str) -> Option<usize> {
    ERROR_SIGNATURES
        .iter()
        .filter_map(|pat| output.find(pat))
        .min()
}

macro_rules! field_regex {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($pattern).expect("valid regex"));
    };
}

field_regex!(TOTAL_TRADES, r"(?i)Total trades:\s*(\d+)");
field_regex!(WIN_RATE, r"(?i)Win Rate:\s*([\d.]+)%\s*\((\d+)\s*wins?,\s*(\d+)\s*losses?\)");
field_regex!(TOTAL_PROFIT, r"(?i)Total profit:\s*(-?[\d.]+)\s*\w+\s*\((-?[\d.]+)%\)");
field_regex!(MAX_DRAWDOWN, r"(?i)Max Drawdown:\s*(-?[\d.]+)\s*\w+\s*\((-?[\d.]+)%\)");
field_regex!(PROFIT_FACTOR, r"(?i)Profit Factor:\s*([\d.]+)");
field_regex!(BEST_TRADE, r"(?i)Best Trade:\s*(-?[\d.]+)%");
field_regex!(WORST_TRADE, r"(?i)Worst Trade:\s*(-?[\d.]+)%");
field_regex!(AVG_DURATION, r"(?i)Avg Trade Duration:\s*([\d.]+)\s*min");
field_regex!(SHARPE, r"(?i)Sharpe Ratio:\s*(-?[\d.]+)");
field_regex!(SORTINO, r"(?i)Sortino Ratio:\s*(-?[\d.]+)");

/// One row of the per-pair breakdown table, e.g.
/// `|  BTC/USDT |  12 |  2.50 | 300.00 |`
field_regex!(
    PAIR_ROW,
    r"(?m)^\|\s*([A-Z0-9]+/[A-Z0-9]+(?::[A-Z0-9]+)?)\s*\|\s*(\d+)\s*\|\s*(-?[\d.]+)\s*\|\s*(-?[\d.]+)\s*\|"
);

pub fn extract_total_trades(output: &str) -> Option<i32> {
    TOTAL_TRADES.captures(output)?.get(1)?.as_str().parse().ok()
}

/// Returns `(win_rate_pct, winners, losers)`.
pub fn extract_win_rate(output: &str) -> Option<(f64, i32, i32)> {
    let caps = WIN_RATE.captures(output)?;
    Some((
        caps.get(1)?.as_str().parse().ok()?,
        caps.get(2)?.as_str().parse().ok()?,
        caps.get(3)?.as_str().parse().ok()?,
    ))
}

/// Returns `(profit_abs, profit_pct)`.
pub fn extract_total_profit(output: &str) -> Option<(f64, f64)> {
    let caps = TOTAL_PROFIT.captures(output)?;
    Some((caps.get(1)?.as_str().parse().ok()?, caps.get(2)?.as_str().parse().ok()?))
}

/// Returns `(drawdown_abs, drawdown_pct)`.
pub fn extract_max_drawdown(output: &str) -> Option<(f64, f64)> {
    let caps = MAX_DRAWDOWN.captures(output)?;
    Some((caps.get(1)?.as_str().parse().ok()?, caps.get(2)?.as_str().parse().ok()?))
}

pub fn extract_profit_factor(output: &str) -> Option<f64> {
    PROFIT_FACTOR.captures(output)?.get(1)?.as_str().parse().ok()
}

pub fn extract_best_trade_pct(output: &str) -> Option<f64> {
    BEST_TRADE.captures(output)?.get(1)?.as_str().parse().ok()
}

pub fn extract_worst_trade_pct(output: &str) -> Option<f64> {
    WORST_TRADE.captures(output)?.get(1)?.as_str().parse().ok()
}

pub fn extract_avg_trade_duration_minutes(output: &str) -> Option<f64> {
    AVG_DURATION.captures(output)?.get(1)?.as_str().parse().ok()
}

pub fn extract_sharpe_ratio(output: &str) -> Option<f64> {
    SHARPE.captures(output)?.get(1)?.as_str().parse().ok()
}

pub fn extract_sortino_ratio(output: &str) -> Option<f64> {
    SORTINO.captures(output)?.get(1)?.as_str().parse().ok()
}

/// `(pair, trades, profit_pct, profit_abs)` for every row except `TOTAL`.
pub fn extract_pair_breakdown(output: &str) -> Vec<(String, i32, f64, f64)> {
    PAIR_ROW
        .captures_iter(output)
        .filter_map(|caps| {
            let pair = caps.get(1)?.as_str();
            if pair.eq_ignore_ascii_case("total") {
                return None;
            }
            Some((
                pair.to_string(),
                caps.get(2)?.as_str().parse().ok()?,
                caps.get(3)?.as_str().parse().ok()?,
                caps.get(4)?.as_str().parse().ok()?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_earliest_error_signature() {
        let output = "some preamble\nTraceback (most recent call last):\nNameError: foo";
        let idx = find_error_signature(output).unwrap();
        assert_eq!(&output[idx..idx + "Traceback (most recent call last)".len()], "Traceback (most recent call last)");
    }

    #[test]
    fn no_error_signature_in_clean_output() {
        assert!(find_error_signature("Total trades: 12\nWin Rate: 80%").is_none());
    }

    #[test]
    fn missing_optional_field_is_none_not_panic() {
        assert!(extract_sharpe_ratio("Total trades: 5").is_none());
    }

    #[test]
    fn extracts_core_fields() {
        let output = "Total trades: 12\nWin Rate: 83.3% (10 wins, 2 losses)\nTotal profit: 300.00 USDT (30.00%)";
        assert_eq!(extract_total_trades(output), Some(12));
        assert_eq!(extract_win_rate(output), Some((83.3, 10, 2)));
        assert_eq!(extract_total_profit(output), Some((300.00, 30.00)));
    }

    #[test]
    fn extracts_pair_breakdown_excluding_total_row() {
        let output = "\
|  BTC/USDT |       12 |           2.50 |             300.00 |
|  ETH/USDT |        8 |           1.20 |              80.00 |
|     TOTAL |       20 |           2.00 |             380.00 |
";
        let rows = extract_pair_breakdown(output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "BTC/USDT");
        assert_eq!(rows[1].0, "ETH/USDT");
    }
}
