//! Error taxonomy for result parsing.

use bt_core::BtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The output matched one of the known error-signature patterns during
    /// the pre-check. Carries the first 500 characters starting at the
    /// match.
    #[error("backtest error: {0}")]
    StrategyCodeError(String),

    /// The parsed result failed the zero-trades-implies-zero-profit check,
    /// or otherwise couldn't be assembled into a coherent record.
    #[error("inconsistent result: {0}")]
    Inconsistent(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl From<ParseError> for BtError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::StrategyCodeError(msg) => BtError::StrategyCodeError(msg),
            ParseError::Inconsistent(msg) => BtError::Infrastructure(format!("parser produced inconsistent result: {msg}")),
            ParseError::Compression(msg) => BtError::Infrastructure(msg),
        }
    }
}
