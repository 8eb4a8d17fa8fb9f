//! LZ4 block compression for pixel payloads.
//!
//! Output layout matches `lz4_flex::compress_prepend_size`: a 4-byte
//! little-endian uncompressed length followed by one LZ4 block, so consumers
//! can decode with `lz4_flex::decompress_size_prepended`.
//!
//! Compression writes into a caller-supplied slice so the result can live in a
//! pooled buffer sized with [`max_compressed_len`].

use crate::error::DecodeError;

const SIZE_PREFIX: usize = 4;

/// Worst-case output size for `input_len` bytes, including the size prefix.
#[must_use]
pub fn max_compressed_len(input_len: usize) -> usize {
    SIZE_PREFIX + lz4_flex::block::get_maximum_output_size(input_len)
}

/// Compress `input` into `output`, returning the number of bytes written.
pub fn compress_into(input: &[u8], output: &mut [u8]) -> Result<usize, DecodeError> {
    if output.len() < SIZE_PREFIX {
        return Err(DecodeError::Compression(format!(
            "output buffer of {} bytes cannot hold the size prefix",
            output.len()
        )));
    }
    let uncompressed = u32::try_from(input.len()).map_err(|_| {
        DecodeError::Compression(format!("input of {} bytes is too large", input.len()))
    })?;

    let (prefix, body) = output.split_at_mut(SIZE_PREFIX);
    prefix.copy_from_slice(&uncompressed.to_le_bytes());
    let written = lz4_flex::block::compress_into(input, body)
        .map_err(|e| DecodeError::Compression(e.to_string()))?;
    Ok(SIZE_PREFIX + written)
}

/// Decompress a size-prefixed block produced by [`compress_into`].
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, DecodeError> {
    lz4_flex::decompress_size_prepended(input).map_err(|e| DecodeError::Compression(e.to_string()))
}

/// Ratio of uncompressed to compressed size, for logging.
#[must_use]
pub fn compression_ratio(uncompressed: usize, compressed: usize) -> f64 {
    if compressed == 0 || uncompressed == 0 {
        return 1.0;
    }
    uncompressed as f64 / compressed as f64
}
