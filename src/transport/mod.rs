//! Multipart message transport.
//!
//! A message is one JSON header part, optionally followed by one binary
//! payload part. On the wire each part is framed as
//!
//! ```text
//! [flags: u8] [len: u32 BE] [len bytes]      flags bit 0 = more parts follow
//! ```
//!
//! and the part with the `more` bit clear ends the message.
//!
//! The publisher only depends on [`FrameTransport`]; [`tcp::TcpFanOut`] is the
//! network implementation and [`ChannelTransport`] an in-process one.

pub mod tcp;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pilatus_core::TransportError;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

/// Largest single part accepted or produced.
pub const MAX_PART_SIZE: usize = 64 * 1024 * 1024;

const PART_HEADER_LEN: usize = 5;
const FLAG_MORE: u8 = 0x01;

/// An ordered header + optional payload message.
///
/// Cloning shares the underlying bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Multipart {
    /// First part: UTF-8 JSON metadata
    pub header: Bytes,
    /// Second part: binary payload
    pub payload: Option<Bytes>,
}

impl Multipart {
    /// Metadata-only message.
    pub fn header_only(header: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            payload: None,
        }
    }

    /// Header followed by payload.
    pub fn with_payload(header: impl Into<Bytes>, payload: Bytes) -> Self {
        Self {
            header: header.into(),
            payload: Some(payload),
        }
    }

    /// Number of parts (1 or 2).
    #[must_use]
    pub fn part_count(&self) -> usize {
        1 + usize::from(self.payload.is_some())
    }
}

/// Sink for published messages.
#[async_trait]
pub trait FrameTransport: Send {
    /// Queue `message` for delivery, in order.
    ///
    /// May wait for queue space. An error means the transport is unusable.
    async fn send(&mut self, message: Multipart) -> Result<(), TransportError>;
}

/// In-process transport over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Multipart>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes what it sends.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Multipart>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&mut self, message: Multipart) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// `tokio-util` codec for [`Multipart`] messages.
#[derive(Debug, Default)]
pub struct MultipartCodec {
    parts: Vec<Bytes>,
}

impl MultipartCodec {
    /// New codec with no partially received message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn put_part(dst: &mut BytesMut, part: &[u8], more: bool) -> Result<(), TransportError> {
        if part.len() > MAX_PART_SIZE {
            return Err(TransportError::PartTooLarge {
                size: part.len(),
                limit: MAX_PART_SIZE,
            });
        }
        dst.reserve(PART_HEADER_LEN + part.len());
        dst.put_u8(if more { FLAG_MORE } else { 0 });
        dst.put_u32(part.len() as u32);
        dst.extend_from_slice(part);
        Ok(())
    }
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < PART_HEADER_LEN {
                return Ok(None);
            }

            let flags = src[0];
            let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if len > MAX_PART_SIZE {
                return Err(TransportError::PartTooLarge {
                    size: len,
                    limit: MAX_PART_SIZE,
                });
            }
            if src.len() < PART_HEADER_LEN + len {
                src.reserve(PART_HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(PART_HEADER_LEN);
            self.parts.push(src.split_to(len).freeze());

            if flags & FLAG_MORE != 0 {
                if self.parts.len() >= 2 {
                    self.parts.clear();
                    return Err(TransportError::Malformed(
                        "more than two parts in one message".to_string(),
                    ));
                }
                continue;
            }

            let mut parts = std::mem::take(&mut self.parts).into_iter();
            let header = parts.next().unwrap_or_default();
            return Ok(Some(Multipart {
                header,
                payload: parts.next(),
            }));
        }
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Multipart, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::put_part(dst, &item.header, item.payload.is_some())?;
        if let Some(payload) = &item.payload {
            Self::put_part(dst, payload, false)?;
        }
        Ok(())
    }
}
