//! Block compression and checksum for the `<Data>` section (C5).
//!
//! Rows are concatenated with `\n`, zstd-compressed, then base64-encoded.
//! The checksum — when present — covers the base64 bytes and must be
//! verified before any decompression is attempted.

use base64::Engine;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, TdtpError};

/// Below this many bytes of concatenated row text, compression is skipped
/// entirely (the framing overhead would exceed the savings).
pub const DEFAULT_MIN_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct CompressionStats {
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    pub row_count: usize,
}

/// Clamps a requested zstd level into the valid `[1, 19]` range.
pub fn clamp_level(level: i32) -> i32 {
    level.clamp(1, 19)
}

/// Compresses `rows` if their concatenated size meets `min_size`; otherwise
/// returns `Ok(None)` so the caller emits them uncompressed.
pub fn compress_rows(
    rows: &[String],
    level: i32,
    min_size: usize,
) -> Result<Option<(String, CompressionStats)>> {
    let joined = rows.join("\n");
    if joined.len() < min_size {
        return Ok(None);
    }
    let level = clamp_level(level);
    let compressed = zstd::encode_all(joined.as_bytes(), level)
        .map_err(|e| TdtpError::Compression(e.to_string()))?;
    let blob = base64::engine::general_purpose::STANDARD.encode(&compressed);
    let stats = CompressionStats {
        original_bytes: joined.len(),
        compressed_bytes: compressed.len(),
        row_count: rows.len(),
    };
    Ok(Some((blob, stats)))
}

/// Reverses [`compress_rows`]: base64-decodes, zstd-decompresses, and
/// splits the `\n`-joined text back into the original row sequence.
pub fn decompress_blob(base64_blob: &str) -> Result<Vec<String>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(base64_blob)
        .map_err(|e| TdtpError::Compression(format!("invalid base64: {e}")))?;
    let decompressed =
        zstd::decode_all(&compressed[..]).map_err(|e| TdtpError::Compression(e.to_string()))?;
    let text = String::from_utf8(decompressed)
        .map_err(|e| TdtpError::Compression(format!("decompressed data not utf-8: {e}")))?;
    Ok(text.split('\n').map(str::to_string).collect())
}

/// Hex-encoded XXH3-64 checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:016x}", xxh3_64(bytes))
}

/// Verifies `bytes` against a stored hex checksum. Must run before
/// [`decompress_blob`] is called on the same bytes.
pub fn verify(bytes: &[u8], expected_hex: &str) -> Result<()> {
    let computed = checksum(bytes);
    if computed.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(TdtpError::ChecksumMismatch {
            expected: expected_hex.to_string(),
            computed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_rows() -> Vec<String> {
        (0..200).map(|i| format!("row-{i}-with-enough-padding-to-exceed-the-minimum-size-threshold")).collect()
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let rows = big_rows();
        let (blob, stats) = compress_rows(&rows, 9, DEFAULT_MIN_SIZE).unwrap().unwrap();
        assert!(stats.compressed_bytes < stats.original_bytes);
        let restored = decompress_blob(&blob).unwrap();
        assert_eq!(restored, rows);
    }

    #[test]
    fn small_payload_skips_compression() {
        let rows = vec!["a|b".to_string()];
        assert!(compress_rows(&rows, 9, DEFAULT_MIN_SIZE).unwrap().is_none());
    }

    #[test]
    fn checksum_detects_single_byte_flip() {
        let rows = big_rows();
        let (blob, _) = compress_rows(&rows, 3, DEFAULT_MIN_SIZE).unwrap().unwrap();
        let hex = checksum(blob.as_bytes());
        assert!(verify(blob.as_bytes(), &hex).is_ok());

        let mut tampered = blob.into_bytes();
        tampered[0] ^= 0x01;
        let err = verify(&tampered, &hex).unwrap_err();
        assert!(matches!(err, TdtpError::ChecksumMismatch { .. }));
    }

    #[test]
    fn level_is_clamped() {
        assert_eq!(clamp_level(0), 1);
        assert_eq!(clamp_level(50), 19);
        assert_eq!(clamp_level(9), 9);
    }
}
