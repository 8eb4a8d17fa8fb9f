//! ASCII-header (CBF) image decoding.
//!
//! A CBF file is forwarded unchanged: the consumer decompresses the binary
//! section itself. Only the shape is needed here, read from two header labels:
//!
//! ```text
//! X-Binary-Size-Fastest-Dimension: 487   -> width
//! X-Binary-Size-Second-Dimension: 195    -> height
//! ```
//!
//! Labels are searched in the buffer contents up to the binary-section marker.

use pilatus_core::{Compression, DecodeError, StreamResult};
use pilatus_pool::PooledBuffer;
use std::io::{ErrorKind, Read};
use tracing::warn;

use crate::LoadedImage;

/// Label whose value is the image width
pub const WIDTH_LABEL: &str = "X-Binary-Size-Fastest-Dimension:";
/// Label whose value is the image height
pub const HEIGHT_LABEL: &str = "X-Binary-Size-Second-Dimension:";

/// Start of the binary section; no header text follows it.
const BINARY_MARKER: [u8; 4] = [0x0c, 0x1a, 0x04, 0xd5];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Header text region of a CBF buffer.
fn header_region(data: &[u8]) -> &[u8] {
    match find(data, &BINARY_MARKER) {
        Some(end) => &data[..end],
        None => data,
    }
}

/// Parse the decimal integer that follows `label`, skipping blanks.
pub fn labeled_int(data: &[u8], label: &'static str) -> Result<u32, DecodeError> {
    let start = find(data, label.as_bytes()).ok_or(DecodeError::MissingLabel(label))?;
    let rest = &data[start + label.len()..];
    let rest: &[u8] = match rest.iter().position(|b| *b != b' ' && *b != b'\t') {
        Some(skip) => &rest[skip..],
        None => &[],
    };
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();

    std::str::from_utf8(&rest[..digits])
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(DecodeError::InvalidInteger { label })
}

/// Recover `(width, height)` from the header labels.
pub fn decode_shape(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    let header = header_region(data);
    let width = labeled_int(header, WIDTH_LABEL)?;
    let height = labeled_int(header, HEIGHT_LABEL)?;
    Ok((width, height))
}

/// Copy the whole file into `buffer` and decode its shape.
///
/// A file larger than the buffer is an error. Missing or malformed labels are
/// logged and give a zero shape; the payload is still kept.
pub(crate) fn load<R: Read>(reader: &mut R, buffer: &mut PooledBuffer) -> StreamResult<LoadedImage> {
    let capacity = buffer.capacity();
    let slice = buffer.as_mut_slice();
    let mut filled = 0;

    loop {
        if filled == capacity {
            let mut probe = [0u8; 1];
            if reader.read(&mut probe)? != 0 {
                return Err(DecodeError::PayloadTooLarge {
                    length: capacity + 1,
                    capacity,
                }
                .into());
            }
            break;
        }
        match reader.read(&mut slice[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    buffer.set_len(filled)?;

    let (width, height) = decode_shape(buffer.as_slice()).unwrap_or_else(|e| {
        warn!(error = %e, bytes = filled, "Bad CBF header, publishing with zero shape");
        (0, 0)
    });

    Ok(LoadedImage {
        width,
        height,
        compression: Compression::Cbf,
    })
}
