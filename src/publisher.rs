//! Frame publisher.
//!
//! Turns decoded frames and series events into multipart messages and keeps
//! the last published image for the monitor channel.
//!
//! The payload buffer is frozen into `Bytes` without copying. The publisher's
//! retained copy and the transport's copy share it, so the buffer goes back to
//! the pool only after the transport has written it everywhere and a newer
//! image has replaced it here.

use bytes::Bytes;
use pilatus_core::{DetectorFrame, MessageHeader, StreamResult};
use tracing::debug;

use crate::transport::{FrameTransport, Multipart};

/// Publishes frames and series announcements through a [`FrameTransport`].
pub struct FramePublisher<T: FrameTransport> {
    transport: T,
    latest: Option<Multipart>,
    images_published: u64,
}

impl<T: FrameTransport> FramePublisher<T> {
    /// Publisher with nothing retained yet.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            latest: None,
            images_published: 0,
        }
    }

    /// Publish one image as `[header, payload]` and retain it.
    ///
    /// The previously retained image is released.
    pub async fn publish(&mut self, frame: DetectorFrame) -> StreamResult<()> {
        let header = Bytes::from(frame.header().to_json_bytes()?);
        let frame_number = frame.frame_number;
        let payload = frame.payload.freeze();
        let bytes = payload.len();

        let message = Multipart::with_payload(header, payload);
        self.latest = Some(message.clone());
        self.transport.send(message).await?;
        self.images_published += 1;

        debug!(frame = frame_number, bytes, "Published image");
        Ok(())
    }

    /// Publish a metadata-only message (`header` or `series_end`).
    pub async fn announce(&mut self, header: MessageHeader) -> StreamResult<()> {
        let json = header.to_json_bytes()?;
        debug!(header = %String::from_utf8_lossy(&json), "Announcing");
        self.transport.send(Multipart::header_only(json)).await?;
        Ok(())
    }

    /// Most recently published image, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&Multipart> {
        self.latest.as_ref()
    }

    /// Reply for a monitor request: the latest image, or an empty message.
    #[must_use]
    pub fn monitor_reply(&self) -> Multipart {
        self.latest.clone().unwrap_or_default()
    }

    /// Number of images published so far.
    #[must_use]
    pub fn images_published(&self) -> u64 {
        self.images_published
    }

    /// Drop the retained image, returning its buffer to the pool.
    pub fn clear_latest(&mut self) {
        self.latest = None;
    }
}
