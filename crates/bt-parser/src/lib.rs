//! bt-parser: the Result Parser (§4.3) — extracts metrics from unstructured
//! container output and compresses the raw log for storage alongside it.

pub mod compress;
pub mod error;
pub mod parser;
pub mod patterns;

pub use compress::{compress_raw_log, decompress_raw_log, MAX_COMPRESSED_BYTES, TRUNCATION_MARKER};
pub use error::ParseError;
pub use parser::{parse_backtest_output, ERROR_SNIPPET_LEN};
