//! Decoders for the image files a Pilatus detector writes.
//!
//! - [`tiff`]: tag-table images; the header is parsed first, then the strip
//!   is read straight into a pooled buffer
//! - [`cbf`]: ASCII-header images; the whole file is copied into a pooled
//!   buffer and the shape is recovered from header labels
//! - [`naming`]: frame numbers from detector filenames
//!
//! [`load_image`] dispatches on the configured [`SourceFormat`].

pub mod cbf;
pub mod naming;
pub mod tiff;

use pilatus_core::{Compression, SourceFormat, StreamResult};
use pilatus_pool::PooledBuffer;
use std::fs::File;
use std::path::Path;

pub use naming::frame_number;
pub use tiff::TiffInfo;

/// Result of loading one image file into a pooled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Width in pixels, 0 if the header could not be decoded
    pub width: u32,
    /// Height in pixels, 0 if the header could not be decoded
    pub height: u32,
    /// How the bytes written to the buffer are encoded
    pub compression: Compression,
}

/// Read the image at `path` into `buffer`.
///
/// I/O failures are returned as errors. Header decode failures are logged and
/// yield a zero shape so the frame can still be published.
pub fn load_image(
    format: SourceFormat,
    path: &Path,
    buffer: &mut PooledBuffer,
) -> StreamResult<LoadedImage> {
    let mut file = File::open(path)?;
    match format {
        SourceFormat::Tif => tiff::load(&mut file, buffer),
        SourceFormat::Cbf => cbf::load(&mut file, buffer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilatus_pool::BufferPool;
    use std::io::Write;

    #[test]
    fn test_load_image_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..64u8).collect();
        let path = dir.path().join("scan0_00003.tif");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&tiff::build_image(4, 4, "", &payload))
            .unwrap();

        let pool = BufferPool::new(1, 256);
        let mut buffer = pool.try_acquire().unwrap();
        let loaded = load_image(SourceFormat::Tif, &path, &mut buffer).unwrap();

        assert_eq!((loaded.width, loaded.height), (4, 4));
        assert_eq!(loaded.compression, Compression::None);
        assert_eq!(buffer.as_slice(), payload.as_slice());
        assert_eq!(frame_number("scan0_00003.tif"), 3);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = BufferPool::new(1, 16);
        let mut buffer = pool.try_acquire().unwrap();

        let err = load_image(SourceFormat::Cbf, &dir.path().join("gone.cbf"), &mut buffer)
            .unwrap_err();
        assert!(matches!(err, pilatus_core::StreamError::Io(_)));
    }
}
