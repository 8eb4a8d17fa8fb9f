//! Decoded frames and published message headers.
//!
//! Every published message starts with a JSON header tagged by `htype`:
//!
//! ```text
//! {"htype":"header","filename":"scan3.cbf","save_path":"/tmp/foo.cbf"}
//! {"htype":"image","frame":7,"shape":[195,487],"type":"int32","compression":"cbf"}
//! {"htype":"series_end"}
//! ```
//!
//! Only `image` messages carry a second (payload) part.

use pilatus_pool::PooledBuffer;
use serde::{Deserialize, Serialize};

/// How the payload bytes of an image are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Raw little-endian pixels
    #[default]
    None,
    /// Complete CBF file as written by the detector
    Cbf,
    /// Size-prefixed LZ4 block of raw pixels
    Lz4,
}

/// Pixel element type of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// Signed 32-bit counts
    #[default]
    Int32,
}

/// Metadata part of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "htype", rename_all = "snake_case")]
pub enum MessageHeader {
    /// A series was armed; images will follow.
    Header {
        /// Detector-side filename of the series (`scan<N>.<ext>`)
        filename: String,
        /// Path the client originally asked the detector to save to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_path: Option<String>,
    },
    /// One frame; the payload follows as the second part.
    Image {
        /// Frame number within the series
        frame: u32,
        /// `[height, width]`
        shape: [u32; 2],
        /// Pixel element type
        #[serde(rename = "type")]
        element_type: ElementType,
        /// Payload encoding
        compression: Compression,
    },
    /// The last frame of the series has been published.
    SeriesEnd,
}

impl MessageHeader {
    /// Encode as compact JSON.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// One decoded image, ready to publish.
///
/// Holds its payload in a pooled buffer; dropping the frame returns the
/// buffer.
#[derive(Debug)]
pub struct DetectorFrame {
    /// Frame number parsed from the filename
    pub frame_number: u32,
    /// Image width in pixels (0 if the header could not be decoded)
    pub width: u32,
    /// Image height in pixels (0 if the header could not be decoded)
    pub height: u32,
    /// Payload bytes; `payload.len()` is the payload length
    pub payload: PooledBuffer,
    /// Payload encoding
    pub compression: Compression,
}

impl DetectorFrame {
    /// Valid payload bytes.
    #[must_use]
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is encoded rather than raw pixels.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compression != Compression::None
    }

    /// The `image` header describing this frame.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        MessageHeader::Image {
            frame: self.frame_number,
            shape: [self.height, self.width],
            element_type: ElementType::Int32,
            compression: self.compression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilatus_pool::BufferPool;
    use serde_json::json;

    #[test]
    fn test_image_header_json() {
        let header = MessageHeader::Image {
            frame: 7,
            shape: [195, 487],
            element_type: ElementType::Int32,
            compression: Compression::Cbf,
        };
        let value: serde_json::Value =
            serde_json::from_slice(&header.to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"htype":"image","frame":7,"shape":[195,487],"type":"int32","compression":"cbf"})
        );
    }

    #[test]
    fn test_series_header_json() {
        let header = MessageHeader::Header {
            filename: "scan3.cbf".to_string(),
            save_path: None,
        };
        assert_eq!(
            String::from_utf8(header.to_json_bytes().unwrap()).unwrap(),
            r#"{"htype":"header","filename":"scan3.cbf"}"#
        );

        let end = MessageHeader::SeriesEnd.to_json_bytes().unwrap();
        assert_eq!(end, br#"{"htype":"series_end"}"#);
        assert_eq!(
            MessageHeader::from_json_bytes(&end).unwrap(),
            MessageHeader::SeriesEnd
        );
    }

    #[test]
    fn test_frame_header_uses_height_width_order() {
        let pool = BufferPool::new(1, 64);
        let mut payload = pool.try_acquire().unwrap();
        payload.copy_from_slice(&[1, 2, 3, 4]).unwrap();

        let frame = DetectorFrame {
            frame_number: 2,
            width: 487,
            height: 195,
            payload,
            compression: Compression::None,
        };
        assert_eq!(frame.payload_length(), 4);
        assert!(!frame.is_compressed());
        match frame.header() {
            MessageHeader::Image { shape, frame, .. } => {
                assert_eq!(shape, [195, 487]);
                assert_eq!(frame, 2);
            }
            other => panic!("unexpected header {other:?}"),
        }

        drop(frame);
        assert_eq!(pool.available(), 1);
    }
}
