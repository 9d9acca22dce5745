//! Post-process step: gzip the raw container output, collapsing to a
//! head/tail excerpt first if the compressed size would exceed 1 MB.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Compressed-size ceiling before truncation kicks in.
pub const MAX_COMPRESSED_BYTES: usize = 1024 * 1024;
/// Characters kept from the head and tail of an oversized log.
pub const TRUNCATION_EXCERPT_CHARS: usize = 50_000;
pub const TRUNCATION_MARKER: &str = "\n... [truncated: output exceeded 1 MB compressed] ...\n";

pub fn compress_raw_log(output: &str) -> Result<Vec<u8>, std::io::Error> {
    let compressed = gzip(output)?;
    if compressed.len() <= MAX_COMPRESSED_BYTES {
        return Ok(compressed);
    }

    let truncated = truncate_with_marker(output);
    gzip(&truncated)
}

pub fn decompress_raw_log(compressed: &[u8]) -> Result<String, std::io::Error> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

fn gzip(text: &str) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    encoder.finish()
}

/// Collapses `text` to its first and last `TRUNCATION_EXCERPT_CHARS`
/// characters (char-boundary safe) joined by a visible marker.
fn truncate_with_marker(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TRUNCATION_EXCERPT_CHARS * 2 {
        return text.to_string();
    }
    let head: String = chars[..TRUNCATION_EXCERPT_CHARS].iter().collect();
    let tail: String = chars[chars.len() - TRUNCATION_EXCERPT_CHARS..].iter().collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes_under_the_limit() {
        let original = "Total trades: 12\nWin Rate: 80%\n".repeat(100);
        let compressed = compress_raw_log(&original).unwrap();
        let decompressed = decompress_raw_log(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }

    #[test]
    fn oversized_output_is_truncated_with_visible_marker() {
        // Repetitive text compresses well, so force incompressible-ish
        // content to cross the 1 MB compressed threshold within a
        // reasonable test input size: random-looking hex digest lines.
        let mut huge = String::new();
        for i in 0..2_000_000u64 {
            huge.push_str(&format!("{:016x}\n", i.wrapping_mul(2654435761)));
        }
        let compressed = compress_raw_log(&huge).unwrap();
        assert!(compressed.len() <= MAX_COMPRESSED_BYTES);
        let decompressed = decompress_raw_log(&compressed).unwrap();
        assert!(decompressed.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn small_output_is_never_truncated() {
        let original = "short output";
        let compressed = compress_raw_log(original).unwrap();
        let decompressed = decompress_raw_log(&compressed).unwrap();
        assert_eq!(decompressed, original);
        assert!(!decompressed.contains(TRUNCATION_MARKER));
    }
}
