//! TCP fan-out publisher.
//!
//! ```text
//! FramePublisher ──send()──► outbox (bounded) ──► distributor ──► writer task ──► subscriber 1
//!                                                             └─► writer task ──► subscriber 2
//! ```
//!
//! The distributor holds messages until at least one subscriber is connected,
//! then hands every message to every subscriber's writer in FIFO order.
//! Subscribers whose socket fails are dropped. Payload buffers return to the
//! pool once every writer has written (or dropped) its copy.

use async_trait::async_trait;
use futures::SinkExt;
use pilatus_core::TransportError;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use super::{FrameTransport, Multipart, MultipartCodec};

/// Messages buffered per subscriber before the distributor waits on it.
const SUBSCRIBER_QUEUE: usize = 16;

/// A connected subscriber. Dropping it closes the queue; its writer finishes
/// the queued messages and exits.
struct Subscriber {
    peer: SocketAddr,
    sender: mpsc::Sender<Multipart>,
}

/// One-to-many multipart publisher over TCP.
pub struct TcpFanOut {
    outbox: mpsc::Sender<Multipart>,
    local_addr: SocketAddr,
    distributor: JoinHandle<()>,
}

impl TcpFanOut {
    /// Listen on `addr` and start distributing.
    ///
    /// `queue_depth` bounds the messages held while no subscriber is connected
    /// or subscribers are slow; `send` waits once it is full.
    pub async fn bind<A: ToSocketAddrs>(addr: A, queue_depth: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (outbox, inbox) = mpsc::channel(queue_depth.max(1));

        let distributor = tokio::spawn(distribute(listener, inbox));
        info!(addr = %local_addr, "Frame publisher listening");

        Ok(Self {
            outbox,
            local_addr,
            distributor,
        })
    }

    /// Address subscribers connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpFanOut {
    fn drop(&mut self) {
        self.distributor.abort();
    }
}

#[async_trait]
impl FrameTransport for TcpFanOut {
    async fn send(&mut self, message: Multipart) -> Result<(), TransportError> {
        self.outbox
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

async fn distribute(listener: TcpListener, mut inbox: mpsc::Receiver<Multipart>) {
    let mut subscribers: Vec<Subscriber> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, subscribers = subscribers.len() + 1, "Subscriber connected");
                    subscribers.push(spawn_writer(stream, peer));
                }
                Err(e) => warn!(error = %e, "Failed to accept subscriber"),
            },
            message = inbox.recv(), if !subscribers.is_empty() => {
                let Some(message) = message else {
                    debug!("Publisher closed, distributor exiting");
                    break;
                };
                deliver(&mut subscribers, message).await;
            }
        }
    }
}

async fn deliver(subscribers: &mut Vec<Subscriber>, message: Multipart) {
    let mut failed = Vec::new();
    for (i, subscriber) in subscribers.iter().enumerate() {
        if subscriber.sender.send(message.clone()).await.is_err() {
            failed.push(i);
        }
    }
    for i in failed.into_iter().rev() {
        let subscriber = subscribers.remove(i);
        warn!(peer = %subscriber.peer, remaining = subscribers.len(), "Subscriber dropped");
    }
}

fn spawn_writer(stream: TcpStream, peer: SocketAddr) -> Subscriber {
    let (sender, mut queue) = mpsc::channel::<Multipart>(SUBSCRIBER_QUEUE);
    tokio::spawn(async move {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Could not set TCP_NODELAY");
        }
        let mut framed = FramedWrite::new(stream, MultipartCodec::new());
        while let Some(message) = queue.recv().await {
            if let Err(e) = framed.send(message).await {
                warn!(%peer, error = %e, "Write to subscriber failed");
                break;
            }
        }
    });
    Subscriber { peer, sender }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio_util::codec::FramedRead;

    async fn subscribe(addr: SocketAddr) -> FramedRead<TcpStream, MultipartCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        FramedRead::new(stream, MultipartCodec::new())
    }

    #[tokio::test]
    async fn test_messages_wait_for_first_subscriber() {
        let mut fanout = TcpFanOut::bind("127.0.0.1:0", 8).await.unwrap();

        // Queued with nobody listening.
        fanout.send(Multipart::header_only("first")).await.unwrap();
        fanout
            .send(Multipart::with_payload("second", Bytes::from_static(b"px")))
            .await
            .unwrap();

        let mut sub = subscribe(fanout.local_addr()).await;
        let first = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first.header[..], b"first");
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.payload.as_deref(), Some(&b"px"[..]));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_message() {
        let mut fanout = TcpFanOut::bind("127.0.0.1:0", 8).await.unwrap();
        let mut a = subscribe(fanout.local_addr()).await;
        let mut b = subscribe(fanout.local_addr()).await;
        // Let the distributor register both before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..3 {
            fanout
                .send(Multipart::header_only(format!("m{i}")))
                .await
                .unwrap();
        }

        for sub in [&mut a, &mut b] {
            for i in 0..3 {
                let message = tokio::time::timeout(Duration::from_secs(2), sub.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                assert_eq!(message.header, Bytes::from(format!("m{i}")));
            }
        }
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_dropped() {
        let mut fanout = TcpFanOut::bind("127.0.0.1:0", 8).await.unwrap();
        let gone = subscribe(fanout.local_addr()).await;
        let mut stays = subscribe(fanout.local_addr()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(gone);

        for i in 0..20 {
            fanout
                .send(Multipart::with_payload(
                    format!("m{i}"),
                    Bytes::from(vec![0u8; 64 * 1024]),
                ))
                .await
                .unwrap();
        }

        for i in 0..20 {
            let message = tokio::time::timeout(Duration::from_secs(5), stays.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(message.header, Bytes::from(format!("m{i}")));
        }
    }
}
