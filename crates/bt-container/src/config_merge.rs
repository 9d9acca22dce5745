//! Config-merge tree: dotted-path overrides onto a base template.
//!
//! A tagged-variant value tree plus a `set_path` operation that creates
//! intermediate maps on demand, instead of mutating `serde_json::Value` in
//! place with ad-hoc recursion at every call site. `ConfigValue` is that
//! tree; `merge_base_template` is the one place it gets built and flattened
//! back to JSON for the container's bind-mounted config file.

use std::collections::BTreeMap;

use bt_core::BacktestConfig;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Scalar(Value),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => ConfigValue::Map(
                map.into_iter().map(|(k, v)| (k, ConfigValue::from_json(v))).collect(),
            ),
            Value::Array(items) => {
                ConfigValue::List(items.into_iter().map(ConfigValue::from_json).collect())
            }
            scalar => ConfigValue::Scalar(scalar),
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            ConfigValue::Scalar(v) => v,
            ConfigValue::List(items) => {
                Value::Array(items.into_iter().map(ConfigValue::into_json).collect())
            }
            ConfigValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, v.into_json())).collect())
            }
        }
    }

    /// Sets `dotted.path` to `value`, creating intermediate maps as needed.
    /// A non-map node encountered mid-path is replaced by a fresh map — a
    /// caller setting `section.key` where `section` was previously a scalar
    /// wins.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.');
        let Some(first) = segments.next() else { return };
        self.set_segments(first, segments, value);
    }

    fn set_segments<'a>(
        &mut self,
        key: &'a str,
        mut rest: impl Iterator<Item = &'a str>,
        value: Value,
    ) {
        let map = match self {
            ConfigValue::Map(map) => map,
            _ => {
                *self = ConfigValue::Map(BTreeMap::new());
                let ConfigValue::Map(map) = self else { unreachable!() };
                map
            }
        };

        match rest.next() {
            Some(next_key) => {
                let child = map
                    .entry(key.to_string())
                    .or_insert_with(|| ConfigValue::Map(BTreeMap::new()));
                child.set_segments(next_key, rest, value);
            }
            None => {
                map.insert(key.to_string(), ConfigValue::Scalar(value));
            }
        }
    }
}

/// `BASE/QUOTE` -> `BASE/QUOTE:QUOTE`, applied when `trading_mode` is
/// `"futures"`.
pub fn rewrite_futures_pair(pair: &str) -> String {
    match pair.split_once('/') {
        Some((base, quote)) if !quote.contains(':') => format!("{base}/{quote}:{quote}"),
        _ => pair.to_string(),
    }
}

/// Deep-copies `base_template`, layers the job's `BacktestConfig` onto it,
/// rewrites pair identifiers for futures mode, then applies non-empty
/// dotted-path overrides. Never mutates the caller's template `Value`.
pub fn merge_base_template(
    base_template: &Value,
    config: &BacktestConfig,
    exchange_trading_mode: Option<&str>,
) -> Value {
    let mut tree = ConfigValue::from_json(base_template.clone());

    tree.set_path("exchange.name", Value::String(config.exchange.clone()));
    tree.set_path("timeframe", Value::String(config.timeframe.clone()));
    tree.set_path(
        "timerange",
        Value::String(format!(
            "{}-{}",
            config.timerange_start.format("%Y%m%d"),
            config.timerange_end.format("%Y%m%d"),
        )),
    );
    tree.set_path("dry_run_wallet", json_number(config.wallet_amount));
    tree.set_path("max_open_trades", json_number(config.max_open_positions as f64));
    tree.set_path("stake_amount", json_number(config.stake_amount));

    let is_futures = exchange_trading_mode == Some("futures");
    let pairs: Vec<Value> = config
        .pairs
        .iter()
        .map(|pair| {
            let pair = if is_futures { rewrite_futures_pair(pair) } else { pair.clone() };
            Value::String(pair)
        })
        .collect();
    tree.set_path("exchange.pair_whitelist", Value::Array(pairs));

    for (path, value) in &config.overrides {
        if value_is_empty(value) {
            continue;
        }
        tree.set_path(path, value.clone());
    }

    tree.into_json()
}

fn json_number(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Only non-empty caller values override template values.
fn value_is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(overrides: HashMap<String, Value>) -> BacktestConfig {
        BacktestConfig {
            exchange: "binance".into(),
            pairs: vec!["BTC/USDT".into(), "ETH/USDT".into()],
            timeframe: "5m".into(),
            timerange_start: chrono::Utc::now() - chrono::Duration::days(30),
            timerange_end: chrono::Utc::now(),
            wallet_amount: 1000.0,
            max_open_positions: 3,
            stake_amount: 100.0,
            overrides,
        }
    }

    #[test]
    fn set_path_creates_intermediate_maps() {
        let mut tree = ConfigValue::Map(BTreeMap::new());
        tree.set_path("exchange.ccxt_config.enableRateLimit", Value::Bool(true));
        let json = tree.into_json();
        assert_eq!(json["exchange"]["ccxt_config"]["enableRateLimit"], Value::Bool(true));
    }

    #[test]
    fn futures_pairs_get_quote_suffix() {
        assert_eq!(rewrite_futures_pair("BTC/USDT"), "BTC/USDT:USDT");
        // Already rewritten pairs are left alone.
        assert_eq!(rewrite_futures_pair("BTC/USDT:USDT"), "BTC/USDT:USDT");
    }

    #[test]
    fn spot_pairs_are_untouched() {
        let merged = merge_base_template(&serde_json::json!({}), &cfg(HashMap::new()), Some("spot"));
        assert_eq!(merged["exchange"]["pair_whitelist"][0], "BTC/USDT");
    }

    #[test]
    fn futures_mode_rewrites_pair_whitelist() {
        let merged = merge_base_template(&serde_json::json!({}), &cfg(HashMap::new()), Some("futures"));
        assert_eq!(merged["exchange"]["pair_whitelist"][0], "BTC/USDT:USDT");
    }

    #[test]
    fn empty_override_values_never_win_over_template() {
        let base = serde_json::json!({"stake_currency": "USDT"});
        let mut overrides = HashMap::new();
        overrides.insert("stake_currency".to_string(), Value::String(String::new()));
        let merged = merge_base_template(&base, &cfg(overrides), None);
        assert_eq!(merged["stake_currency"], "USDT");
    }

    #[test]
    fn non_empty_override_wins() {
        let base = serde_json::json!({"stake_currency": "USDT"});
        let mut overrides = HashMap::new();
        overrides.insert("stake_currency".to_string(), Value::String("BUSD".into()));
        let merged = merge_base_template(&base, &cfg(overrides), None);
        assert_eq!(merged["stake_currency"], "BUSD");
    }

    #[test]
    fn deep_copy_never_mutates_caller_template() {
        let base = serde_json::json!({"stake_currency": "USDT"});
        let base_clone = base.clone();
        let _ = merge_base_template(&base, &cfg(HashMap::new()), None);
        assert_eq!(base, base_clone);
    }
}
