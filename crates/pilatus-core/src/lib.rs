//! Core types shared by the Pilatus frame streamer crates.
//!
//! - [`error`]: error taxonomy used across decoders, control protocol and transport
//! - [`config`]: resolved deployment settings loaded with figment
//! - [`frame`]: decoded frames and the JSON message headers published for them
//! - [`compression`]: optional LZ4 block transform applied to pixel payloads

pub mod compression;
pub mod config;
pub mod error;
pub mod frame;

pub use config::{DetectorSize, LogFormat, SourceFormat, StreamerConfig};
pub use error::{DecodeError, ProtocolParseError, StreamError, StreamResult, TransportError};
pub use frame::{Compression, DetectorFrame, ElementType, MessageHeader};

/// Size in bytes of one pixel element (`int32`).
pub const ELEMENT_SIZE: usize = 4;
