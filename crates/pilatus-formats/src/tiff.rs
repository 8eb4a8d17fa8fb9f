//! Tag-table (TIFF) image decoding.
//!
//! Pilatus TIFFs are single-strip, uncompressed `int32` images. Decoding is
//! two steps so the pixel data is never copied twice:
//!
//! 1. [`parse`] reads the 8-byte header and the image file directory (IFD)
//!    and returns a [`TiffInfo`] with the strip location.
//! 2. [`read_payload`] seeks to the strip and reads it straight into a
//!    pooled buffer.
//!
//! ## Layout
//!
//! ```text
//! header:  [byte order: "II"|"MM"] [magic: u16 = 42] [ifd offset: u32]
//! ifd:     [tag count: u16] then count x 12-byte entries
//! entry:   [tag id: u16] [type: u16] [count: u32] [value or offset: u32]
//! ```
//!
//! Values of 4 bytes or fewer are stored inline, left-justified.

use pilatus_core::{Compression, DecodeError, StreamError, StreamResult};
use pilatus_pool::PooledBuffer;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use tracing::{debug, warn};

use crate::LoadedImage;

/// Image width in pixels
pub const IMAGE_WIDTH: u16 = 256;
/// Image height in pixels
pub const IMAGE_HEIGHT: u16 = 257;
/// Bits per pixel sample
pub const BITS_PER_SAMPLE: u16 = 258;
/// Free-text description (detector writes acquisition settings here)
pub const IMAGE_DESCRIPTION: u16 = 270;
/// Offset of the pixel strip
pub const STRIP_OFFSETS: u16 = 273;
/// Length of the pixel strip
pub const STRIP_BYTE_COUNTS: u16 = 279;

const HEADER_LEN: usize = 8;
const ENTRY_LEN: usize = 12;
const TIFF_MAGIC: u16 = 42;
const TYPE_SHORT: u16 = 3;
const MAX_DESCRIPTION_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn from_marker(marker: [u8; 2]) -> Result<Self, DecodeError> {
        match &marker {
            b"II" => Ok(ByteOrder::Little),
            b"MM" => Ok(ByteOrder::Big),
            _ => Err(DecodeError::ByteOrder(u16::from_be_bytes(marker))),
        }
    }

    fn u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// One IFD entry.
#[derive(Debug, Clone, Copy)]
struct TagEntry {
    id: u16,
    data_type: u16,
    count: u32,
    raw: [u8; 4],
}

impl TagEntry {
    fn from_bytes(order: ByteOrder, bytes: &[u8; ENTRY_LEN]) -> Self {
        Self {
            id: order.u16([bytes[0], bytes[1]]),
            data_type: order.u16([bytes[2], bytes[3]]),
            count: order.u32([bytes[4], bytes[5], bytes[6], bytes[7]]),
            raw: [bytes[8], bytes[9], bytes[10], bytes[11]],
        }
    }

    /// Inline scalar value, honoring left-justified SHORTs.
    fn value(&self, order: ByteOrder) -> u32 {
        if self.data_type == TYPE_SHORT {
            u32::from(order.u16([self.raw[0], self.raw[1]]))
        } else {
            order.u32(self.raw)
        }
    }
}

/// Geometry and strip location of a parsed TIFF.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TiffInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per sample (32 for Pilatus)
    pub bits_per_sample: u32,
    /// Absolute file offset of the pixel strip
    pub payload_offset: u64,
    /// Length of the pixel strip in bytes
    pub payload_length: usize,
    /// Image description text, if present
    pub description: Option<String>,
}

impl TiffInfo {
    /// Exposure time in seconds, from an `Exposure_time` line in the description.
    #[must_use]
    pub fn exposure_time(&self) -> Option<f32> {
        let description = self.description.as_deref()?;
        let start = description.find("Exposure_time")? + "Exposure_time".len();
        description[start..]
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok())
    }
}

/// Map a short read to a truncation error, keep other I/O errors as I/O.
fn read_region<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> StreamResult<()> {
    let needed = buf.len();
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            StreamError::Decode(DecodeError::Truncated {
                what,
                needed,
            })
        } else {
            StreamError::Io(e)
        }
    })
}

/// Parse the header and directory of a TIFF.
///
/// Unrecognized tags are skipped. Fails if the header or directory cannot be
/// read, or if the strip location tags are missing.
pub fn parse<R: Read + Seek>(reader: &mut R) -> StreamResult<TiffInfo> {
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; HEADER_LEN];
    read_region(reader, &mut header, "header")?;

    let order = ByteOrder::from_marker([header[0], header[1]])?;
    let magic = order.u16([header[2], header[3]]);
    if magic != TIFF_MAGIC {
        debug!(magic, "Unexpected TIFF magic number");
    }
    let ifd_offset = order.u32([header[4], header[5], header[6], header[7]]);

    reader.seek(SeekFrom::Start(u64::from(ifd_offset)))?;
    let mut count = [0u8; 2];
    read_region(reader, &mut count, "directory")?;
    let tag_count = order.u16(count);

    let mut entries = Vec::with_capacity(usize::from(tag_count));
    let mut entry = [0u8; ENTRY_LEN];
    for _ in 0..tag_count {
        read_region(reader, &mut entry, "directory entry")?;
        entries.push(TagEntry::from_bytes(order, &entry));
    }

    let mut info = TiffInfo::default();
    let mut strip_offset = None;
    let mut strip_length = None;
    let mut description_tag = None;

    for tag in &entries {
        match tag.id {
            IMAGE_WIDTH => info.width = tag.value(order),
            IMAGE_HEIGHT => info.height = tag.value(order),
            BITS_PER_SAMPLE => info.bits_per_sample = tag.value(order),
            IMAGE_DESCRIPTION => description_tag = Some(*tag),
            STRIP_OFFSETS | STRIP_BYTE_COUNTS if tag.count != 1 => {
                return Err(DecodeError::Unsupported("multi-strip image").into());
            }
            STRIP_OFFSETS => strip_offset = Some(tag.value(order)),
            STRIP_BYTE_COUNTS => strip_length = Some(tag.value(order)),
            _ => {}
        }
    }

    info.payload_offset = u64::from(strip_offset.ok_or(DecodeError::MissingTag(STRIP_OFFSETS))?);
    info.payload_length =
        strip_length.ok_or(DecodeError::MissingTag(STRIP_BYTE_COUNTS))? as usize;

    if let Some(tag) = description_tag {
        info.description = read_description(reader, order, &tag)?;
    }

    debug!(
        width = info.width,
        height = info.height,
        bits_per_sample = info.bits_per_sample,
        offset = info.payload_offset,
        bytes = info.payload_length,
        "Parsed TIFF directory"
    );

    Ok(info)
}

fn read_description<R: Read + Seek>(
    reader: &mut R,
    order: ByteOrder,
    tag: &TagEntry,
) -> StreamResult<Option<String>> {
    let len = (tag.count as usize).min(MAX_DESCRIPTION_LEN);
    let bytes = if len <= tag.raw.len() {
        tag.raw[..len].to_vec()
    } else {
        reader.seek(SeekFrom::Start(u64::from(order.u32(tag.raw))))?;
        let mut text = vec![0u8; len];
        read_region(reader, &mut text, "description")?;
        text
    };
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim_end_matches('\0');
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Seek to `offset` and read `length` bytes into the front of `buffer`.
pub fn read_payload<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    length: usize,
    buffer: &mut PooledBuffer,
) -> StreamResult<()> {
    let capacity = buffer.capacity();
    if length > capacity {
        return Err(DecodeError::PayloadTooLarge { length, capacity }.into());
    }
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buffer.as_mut_slice()[..length])?;
    buffer.set_len(length)?;
    Ok(())
}

/// Parse and read a TIFF into `buffer`.
///
/// A header that cannot be decoded yields an empty payload and zero shape.
pub(crate) fn load<R: Read + Seek>(
    reader: &mut R,
    buffer: &mut PooledBuffer,
) -> StreamResult<LoadedImage> {
    let decoded = parse(reader).and_then(|info| {
        read_payload(reader, info.payload_offset, info.payload_length, buffer)?;
        Ok(info)
    });

    match decoded {
        Ok(info) => {
            if let Some(exposure) = info.exposure_time() {
                debug!(exposure, "Exposure time from image description");
            }
            Ok(LoadedImage {
                width: info.width,
                height: info.height,
                compression: Compression::None,
            })
        }
        Err(StreamError::Decode(e)) => {
            warn!(error = %e, "Could not decode TIFF header, publishing empty frame");
            buffer.set_len(0)?;
            Ok(LoadedImage {
                width: 0,
                height: 0,
                compression: Compression::None,
            })
        }
        Err(e) => Err(e),
    }
}

/// Build a minimal little-endian single-strip TIFF.
///
/// Writes one directory entry for each recognized tag. Used to produce
/// fixtures for the decoder and for replaying acquisitions without a detector.
#[must_use]
pub fn build_image(width: u32, height: u32, description: &str, payload: &[u8]) -> Vec<u8> {
    let description = format!("{description}\0");
    let tags: u16 = 6;
    let ifd_offset = HEADER_LEN as u32;
    let ifd_len = 2 + usize::from(tags) * ENTRY_LEN + 4;
    let description_offset = HEADER_LEN + ifd_len;
    let payload_offset = description_offset + description.len();

    let mut out = Vec::with_capacity(payload_offset + payload.len());
    out.extend_from_slice(b"II");
    out.extend_from_slice(&TIFF_MAGIC.to_le_bytes());
    out.extend_from_slice(&ifd_offset.to_le_bytes());

    out.extend_from_slice(&tags.to_le_bytes());
    let mut entry = |id: u16, data_type: u16, count: u32, value: u32| {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&data_type.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    };
    entry(IMAGE_WIDTH, 4, 1, width);
    entry(IMAGE_HEIGHT, 4, 1, height);
    entry(BITS_PER_SAMPLE, TYPE_SHORT, 1, 32);
    entry(
        IMAGE_DESCRIPTION,
        2,
        description.len() as u32,
        description_offset as u32,
    );
    entry(STRIP_OFFSETS, 4, 1, payload_offset as u32);
    entry(STRIP_BYTE_COUNTS, 4, 1, payload.len() as u32);
    // next IFD
    out.extend_from_slice(&0u32.to_le_bytes());

    out.extend_from_slice(description.as_bytes());
    out.extend_from_slice(payload);
    out
}
