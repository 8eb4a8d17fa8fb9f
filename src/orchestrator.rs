//! Event loop tying the streamer together.
//!
//! One task waits on every input at once and handles each wake to completion
//! before waiting again:
//!
//! ```text
//!   client socket ──┐
//!   client listener ┤                       ┌─► control socket (forward)
//!   control socket ─┼─► Streamer::run ──────┼─► FramePublisher ─► subscribers
//!   watch events ───┤                       └─► monitor replies
//!   monitor requests┘
//! ```
//!
//! Sources are polled in that priority order. At most one client is served;
//! the listener is not polled while a client is connected, so a second client
//! waits in the accept backlog until the first disconnects.

use pilatus_core::{
    compression, Compression, DetectorFrame, MessageHeader, SourceFormat, StreamError,
    StreamResult, StreamerConfig,
};
use pilatus_formats::{frame_number, load_image, LoadedImage};
use pilatus_pool::{BufferPool, PoolError, PooledBuffer};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::acquisition::AcquisitionSession;
use crate::control::{ArmRequest, CompletionRecord, ResponseFramer};
use crate::monitor::MonitorRequest;
use crate::publisher::FramePublisher;
use crate::transport::FrameTransport;
use crate::watcher::WatchEvent;

/// Read size for client and control sockets.
const READ_BUFFER_SIZE: usize = 8192;

/// Already-open handles the streamer multiplexes over.
pub struct StreamerIo {
    /// Listener the control-relay client connects to
    pub client_listener: TcpListener,
    /// Connection to the detector control server
    pub control: TcpStream,
    /// Completed files in the watch folder
    pub watch_events: mpsc::Receiver<WatchEvent>,
    /// Pending monitor requests
    pub monitor_requests: mpsc::Receiver<MonitorRequest>,
}

enum Wake {
    Client(io::Result<usize>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Control(io::Result<usize>),
    Watch(Option<WatchEvent>),
    Monitor(Option<MonitorRequest>),
    Shutdown,
}

/// The streamer: session state, pool, publisher and the sockets it serves.
pub struct Streamer<T: FrameTransport> {
    folder: PathBuf,
    format: SourceFormat,
    compression: bool,
    pool: BufferPool,
    session: AcquisitionSession,
    publisher: FramePublisher<T>,
    framer: ResponseFramer,
    io: StreamerIo,
    client: Option<TcpStream>,
    client_buf: Vec<u8>,
    control_buf: Vec<u8>,
    watch_open: bool,
    monitor_open: bool,
}

impl<T: FrameTransport> Streamer<T> {
    /// Assemble a streamer from resolved configuration and open handles.
    pub fn new(config: &StreamerConfig, pool: BufferPool, transport: T, io: StreamerIo) -> Self {
        Self {
            folder: config.watch_folder.clone(),
            format: config.format,
            compression: config.compression,
            pool,
            session: AcquisitionSession::new(config.format),
            publisher: FramePublisher::new(transport),
            framer: ResponseFramer::new(),
            io,
            client: None,
            client_buf: vec![0u8; READ_BUFFER_SIZE],
            control_buf: vec![0u8; READ_BUFFER_SIZE],
            watch_open: true,
            monitor_open: true,
        }
    }

    /// Handle to the frame buffer pool.
    ///
    /// Shutting the pool down from another task also stops [`run`](Self::run),
    /// even while it waits for a free buffer.
    #[must_use]
    pub fn pool(&self) -> BufferPool {
        self.pool.clone()
    }

    /// Run until `shutdown` resolves, the pool is shut down, or a fatal error.
    pub async fn run<F>(mut self, shutdown: F) -> StreamResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(folder = %self.folder.display(), format = %self.format, "Streamer running");

        let result = loop {
            let wake = tokio::select! {
                biased;
                _ = &mut shutdown => Wake::Shutdown,
                n = read_client(&mut self.client, &mut self.client_buf), if self.client.is_some() => {
                    Wake::Client(n)
                }
                accepted = self.io.client_listener.accept(), if self.client.is_none() => {
                    Wake::Accepted(accepted)
                }
                n = self.io.control.read(&mut self.control_buf) => Wake::Control(n),
                event = self.io.watch_events.recv(), if self.watch_open => Wake::Watch(event),
                request = self.io.monitor_requests.recv(), if self.monitor_open => {
                    Wake::Monitor(request)
                }
            };

            match self.dispatch(wake).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(StreamError::Pool(PoolError::Closed)) if self.pool.is_closed() => {
                    info!("Buffer pool shut down, stopping");
                    break Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Streamer stopped");
                    break Err(e);
                }
            }
        };

        self.publisher.clear_latest();
        self.pool.shutdown();
        info!(
            images = self.publisher.images_published(),
            total_acquires = self.pool.total_acquires(),
            total_returns = self.pool.total_returns(),
            "Streamer finished"
        );
        result
    }

    /// Handle one wake. `Ok(false)` ends the loop.
    async fn dispatch(&mut self, wake: Wake) -> StreamResult<bool> {
        match wake {
            Wake::Shutdown => {
                info!("Shutdown requested");
                return Ok(false);
            }
            Wake::Client(Ok(0)) => self.drop_client("disconnected"),
            Wake::Client(Err(e)) => {
                warn!(error = %e, "Client read failed");
                self.drop_client("read error");
            }
            Wake::Client(Ok(n)) => {
                let request = self.client_buf[..n].to_vec();
                self.handle_request(&request).await?;
            }
            Wake::Accepted(Ok((stream, peer))) => {
                info!(%peer, "Client connected");
                self.client = Some(stream);
            }
            Wake::Accepted(Err(e)) => warn!(error = %e, "Failed to accept client"),
            Wake::Control(Ok(0)) => {
                error!("Detector control server closed the connection");
                return Err(StreamError::ControlDisconnected);
            }
            Wake::Control(Err(e)) => return Err(e.into()),
            Wake::Control(Ok(n)) => {
                let response = self.control_buf[..n].to_vec();
                self.handle_response(&response).await?;
            }
            Wake::Watch(None) => {
                warn!("Watch event stream ended");
                self.watch_open = false;
            }
            Wake::Watch(Some(event)) => {
                self.handle_file(&event.file_name).await?;
                while let Ok(event) = self.io.watch_events.try_recv() {
                    self.handle_file(&event.file_name).await?;
                }
            }
            Wake::Monitor(None) => {
                debug!("Monitor request stream ended");
                self.monitor_open = false;
            }
            Wake::Monitor(Some(request)) => {
                self.answer_monitor(request);
                while let Ok(request) = self.io.monitor_requests.try_recv() {
                    self.answer_monitor(request);
                }
            }
        }
        Ok(true)
    }

    fn drop_client(&mut self, reason: &str) {
        if self.client.take().is_some() {
            info!(reason, "Client disconnected");
        }
    }

    /// Forward a client request, rewriting arm commands.
    async fn handle_request(&mut self, request: &[u8]) -> StreamResult<()> {
        trace!(request = %String::from_utf8_lossy(request), "Client request");

        let forward = match ArmRequest::parse(request) {
            Some(arm) => {
                let series = self.session.arm();
                self.publisher
                    .announce(MessageHeader::Header {
                        filename: series.filename.clone(),
                        save_path: arm.save_path.clone(),
                    })
                    .await?;
                arm.rewrite(&series.filename)
            }
            None => request.to_vec(),
        };

        if let Err(e) = self.io.control.write_all(&forward).await {
            warn!(error = %e, "Forwarding request to detector failed");
        }
        Ok(())
    }

    /// Relay a control response to the client and interpret its records.
    async fn handle_response(&mut self, response: &[u8]) -> StreamResult<()> {
        trace!(response = %String::from_utf8_lossy(response), "Detector response");

        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.write_all(response).await {
                warn!(error = %e, "Relaying response to client failed");
                self.drop_client("write error");
            }
        }

        for record in self.framer.push(response) {
            match CompletionRecord::parse(&record) {
                Ok(Some(completion)) => {
                    info!(status = ?completion.status, file = completion.file_name(), "Acquisition finished");
                    if self.session.complete(&completion) {
                        self.publisher.announce(MessageHeader::SeriesEnd).await?;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping control record"),
            }
        }
        Ok(())
    }

    /// Read, publish and delete one completed file, then check for series end.
    async fn handle_file(&mut self, file_name: &str) -> StreamResult<()> {
        debug!(file = file_name, "New file");
        self.session.observe_file(file_name);

        let path = self.folder.join(file_name);
        match self.read_frame(&path, frame_number(file_name)).await {
            Ok(frame) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(file = %path.display(), error = %e, "Could not delete file");
                }
                self.publisher.publish(frame).await?;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable file"),
        }

        if self.session.check_series_end() {
            self.publisher.announce(MessageHeader::SeriesEnd).await?;
        }
        Ok(())
    }

    async fn read_frame(&self, path: &Path, frame_number: u32) -> StreamResult<DetectorFrame> {
        let buffer = self.pool.acquire().await?;

        let format = self.format;
        let owned_path = path.to_path_buf();
        let (buffer, loaded) = tokio::task::spawn_blocking(move || {
            let mut buffer = buffer;
            let loaded = load_image(format, &owned_path, &mut buffer);
            (buffer, loaded)
        })
        .await
        .map_err(|e| StreamError::Io(io::Error::other(e)))?;
        let loaded = loaded?;

        let (payload, compression) = self.maybe_compress(buffer, loaded).await?;
        Ok(DetectorFrame {
            frame_number,
            width: loaded.width,
            height: loaded.height,
            payload,
            compression,
        })
    }

    /// Apply the LZ4 transform to raw payloads when enabled.
    async fn maybe_compress(
        &self,
        raw: PooledBuffer,
        loaded: LoadedImage,
    ) -> StreamResult<(PooledBuffer, Compression)> {
        if !self.compression || loaded.compression != Compression::None || raw.is_empty() {
            return Ok((raw, loaded.compression));
        }

        let mut packed = self.pool.acquire().await?;
        match compression::compress_into(raw.as_slice(), packed.as_mut_slice()) {
            Ok(written) => {
                packed.set_len(written)?;
                trace!(
                    raw = raw.len(),
                    compressed = written,
                    ratio = compression::compression_ratio(raw.len(), written),
                    "Compressed payload"
                );
                Ok((packed, Compression::Lz4))
            }
            Err(e) => {
                warn!(error = %e, "Compression failed, publishing raw payload");
                Ok((raw, Compression::None))
            }
        }
    }

    fn answer_monitor(&self, request: MonitorRequest) {
        trace!(request_parts = request.body.part_count(), "Monitor request");
        if let Err(e) = request.respond(self.publisher.monitor_reply()) {
            warn!(error = %e, "Monitor reply failed");
        }
    }
}

async fn read_client(client: &mut Option<TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match client {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}
