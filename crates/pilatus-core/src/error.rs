//! Error types for the frame streamer.
//!
//! Each layer reports its own typed error; [`StreamError`] collects them with
//! `#[from]` conversions so the orchestrator can use `?` throughout.
//!
//! ## Recovery policy
//!
//! - **`Io`**: file open/read/seek/delete failures. The file is skipped and the
//!   loop continues.
//! - **`Decode`**: malformed image headers. The frame is still published with a
//!   zeroed shape so downstream frame counts stay continuous.
//! - **`Protocol`**: malformed control-channel record. The record is skipped.
//! - **`Pool`**: acquire after shutdown. Ends the session.
//! - **`Transport`**: publish failures end the session; monitor reply failures
//!   are logged and ignored.
//! - **`Config`** / **`Configuration`**: startup only.

use pilatus_pool::PoolError;
use thiserror::Error;

/// Convenience alias for results using the streamer error type.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Failures while decoding an image file header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// File is shorter than the fixed TIFF header or a directory entry.
    #[error("file ends inside {what} ({needed} bytes expected)")]
    Truncated {
        /// Region being read
        what: &'static str,
        /// Bytes required
        needed: usize,
    },

    /// Byte-order marker is neither `II` nor `MM`.
    #[error("unsupported byte order marker {0:#06x}")]
    ByteOrder(u16),

    /// A TIFF tag needed to locate the payload is absent.
    #[error("required tag {0} not present")]
    MissingTag(u16),

    /// The file uses a layout this decoder does not handle.
    #[error("unsupported layout: {0}")]
    Unsupported(&'static str),

    /// A required CBF header label is absent.
    #[error("label '{0}' not found in header")]
    MissingLabel(&'static str),

    /// The value after a label is not a decimal integer.
    #[error("label '{label}' is not followed by an integer")]
    InvalidInteger {
        /// Label whose value failed to parse
        label: &'static str,
    },

    /// Declared payload does not fit in a pooled buffer.
    #[error("payload of {length} bytes exceeds buffer capacity of {capacity} bytes")]
    PayloadTooLarge {
        /// Declared payload length
        length: usize,
        /// Buffer capacity
        capacity: usize,
    },

    /// LZ4 block could not be compressed or decompressed.
    #[error("compression failed: {0}")]
    Compression(String),
}

/// A control-channel completion record that could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed completion record '{record}': {reason}")]
pub struct ProtocolParseError {
    /// Record text with the terminator removed
    pub record: String,
    /// What was wrong with it
    pub reason: &'static str,
}

impl ProtocolParseError {
    /// Create a parse error for `record`.
    pub fn new(record: impl Into<String>, reason: &'static str) -> Self {
        Self {
            record: record.into(),
            reason,
        }
    }
}

/// Failures in the multipart transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The publish queue or its distributor is gone.
    #[error("publish channel closed")]
    Closed,

    /// A single part is larger than the wire format allows.
    #[error("message part of {size} bytes exceeds limit of {limit} bytes")]
    PartTooLarge {
        /// Part size in bytes
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// A multipart message did not have the expected shape.
    #[error("malformed multipart message: {0}")]
    Malformed(String),

    /// Socket I/O on a subscriber or monitor peer.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Primary error type for the frame streamer.
#[derive(Error, Debug)]
pub enum StreamError {
    /// File or socket I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image header decoding
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Control channel record parsing
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolParseError),

    /// Buffer pool closed or exhausted
    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Publish or monitor transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration file or environment could not be parsed
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Message header could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration parsed but is semantically invalid
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Detector control server closed the connection
    #[error("control channel disconnected")]
    ControlDisconnected,
}

impl From<figment::Error> for StreamError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl StreamError {
    /// Whether the orchestrator must stop after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Pool(PoolError::Closed)
                | StreamError::Transport(TransportError::Closed)
                | StreamError::ControlDisconnected
                | StreamError::Config(_)
                | StreamError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let err: StreamError = DecodeError::MissingLabel("X-Binary-Size:").into();
        assert!(matches!(err, StreamError::Decode(_)));
        assert!(!err.is_fatal());

        let err: StreamError = PoolError::Closed.into();
        assert!(err.is_fatal());

        let err: StreamError = TransportError::Closed.into();
        assert!(err.is_fatal());

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StreamError = io.into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ProtocolParseError::new("7 OK", "missing path");
        assert_eq!(
            err.to_string(),
            "malformed completion record '7 OK': missing path"
        );

        let err = DecodeError::PayloadTooLarge {
            length: 10,
            capacity: 4,
        };
        assert!(err.to_string().contains("10 bytes"));
    }
}
