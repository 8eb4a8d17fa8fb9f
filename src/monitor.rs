//! Monitor request/reply side-channel.
//!
//! Any multipart request on a monitor connection is answered with the most
//! recently published image (header + payload). Connections are strictly
//! request-then-reply. The reply itself is produced by the orchestrator:
//! each request is forwarded as a [`MonitorRequest`] carrying a oneshot reply
//! slot, so the orchestrator treats "monitor request pending" as one more
//! event source.

use futures::{SinkExt, StreamExt};
use pilatus_core::TransportError;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::transport::{Multipart, MultipartCodec};

/// Pending monitor requests held before connections stop reading.
const REQUEST_QUEUE: usize = 16;

/// A monitor request waiting for its reply.
#[derive(Debug)]
pub struct MonitorRequest {
    /// Request body (ignored)
    pub body: Multipart,
    reply: oneshot::Sender<Multipart>,
}

impl MonitorRequest {
    /// Create a request and the receiver its reply arrives on.
    #[must_use]
    pub fn new(body: Multipart) -> (Self, oneshot::Receiver<Multipart>) {
        let (reply, rx) = oneshot::channel();
        (Self { body, reply }, rx)
    }

    /// Answer the request.
    ///
    /// Fails if the requesting connection has gone away.
    pub fn respond(self, message: Multipart) -> Result<(), TransportError> {
        self.reply.send(message).map_err(|_| TransportError::Closed)
    }
}

/// TCP server for monitor connections.
pub struct MonitorServer {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl MonitorServer {
    /// Listen on `addr`; requests are delivered on the returned receiver.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
    ) -> io::Result<(Self, mpsc::Receiver<MonitorRequest>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);

        let acceptor = tokio::spawn(accept_loop(listener, requests));
        info!(addr = %local_addr, "Monitor listening");

        Ok((
            Self {
                local_addr,
                acceptor,
            },
            rx,
        ))
    }

    /// Address monitor clients connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MonitorServer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(listener: TcpListener, requests: mpsc::Sender<MonitorRequest>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Monitor client connected");
                tokio::spawn(serve_connection(stream, peer, requests.clone()));
            }
            Err(e) => warn!(error = %e, "Failed to accept monitor client"),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    requests: mpsc::Sender<MonitorRequest>,
) {
    let mut framed = Framed::new(stream, MultipartCodec::new());

    while let Some(received) = framed.next().await {
        let body = match received {
            Ok(body) => body,
            Err(e) => {
                warn!(%peer, error = %e, "Bad monitor request");
                break;
            }
        };

        let (request, reply) = MonitorRequest::new(body);
        if requests.send(request).await.is_err() {
            debug!(%peer, "Streamer stopped, closing monitor connection");
            break;
        }
        let Ok(message) = reply.await else {
            break;
        };
        if let Err(e) = framed.send(message).await {
            warn!(%peer, error = %e, "Monitor reply failed");
            break;
        }
    }
    debug!(%peer, "Monitor client disconnected");
}
