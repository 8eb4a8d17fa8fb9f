//! End-to-end run over loopback: a fake camserver, one control client, one
//! subscriber, one monitor client and a real watched folder.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use futures::{SinkExt, StreamExt};
use pilatus_core::{SourceFormat, StreamerConfig};
use pilatus_pool::BufferPool;
use pilatus_streamer::monitor::MonitorServer;
use pilatus_streamer::transport::tcp::TcpFanOut;
use pilatus_streamer::transport::MultipartCodec;
use pilatus_streamer::watcher::FolderWatcher;
use pilatus_streamer::{Multipart, Streamer, StreamerIo};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(5);

fn cbf_file(width: u32, height: u32, fill: u8) -> Vec<u8> {
    let mut file = format!(
        "###CBF: VERSION 1.5\r\n\
         # Exposure_time 0.1 s\r\n\
         X-Binary-Size-Fastest-Dimension: {width}\r\n\
         X-Binary-Size-Second-Dimension: {height}\r\n\r\n"
    )
    .into_bytes();
    file.extend_from_slice(&[0x0c, 0x1a, 0x04, 0xd5]);
    file.extend(std::iter::repeat(fill).take((width * height * 4) as usize));
    file
}

/// Write under a staging name, then rename into the watched folder.
fn deliver(staging: &Path, watched: &Path, name: &str, contents: &[u8]) {
    let temp = staging.join(format!("{name}.part"));
    std::fs::write(&temp, contents).unwrap();
    std::fs::rename(&temp, watched.join(name)).unwrap();
}

fn header_json(message: &Multipart) -> Value {
    serde_json::from_slice(&message.header).unwrap()
}

#[tokio::test]
async fn test_full_series_over_loopback() {
    let staging = TempDir::new().unwrap();
    let watched = TempDir::new().unwrap();
    let config = StreamerConfig {
        watch_folder: watched.path().to_path_buf(),
        format: SourceFormat::Cbf,
        pool_size: 8,
        ..Default::default()
    };
    let pool = BufferPool::new(config.pool_size, 4096);

    let camserver_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control = TcpStream::connect(camserver_listener.local_addr().unwrap())
        .await
        .unwrap();
    let (mut camserver, _) = camserver_listener.accept().await.unwrap();

    let (_watcher, watch_events) = FolderWatcher::new(watched.path(), config.pool_size).unwrap();
    let fan_out = TcpFanOut::bind("127.0.0.1:0", config.pool_size).await.unwrap();
    let publish_addr = fan_out.local_addr();
    let (monitor_server, monitor_requests) = MonitorServer::bind("127.0.0.1:0").await.unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();

    let streamer = Streamer::new(
        &config,
        pool.clone(),
        fan_out,
        StreamerIo {
            client_listener,
            control,
            watch_events,
            monitor_requests,
        },
    );
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(streamer.run(async {
        let _ = stop_rx.await;
    }));

    let mut subscriber = Framed::new(
        TcpStream::connect(publish_addr).await.unwrap(),
        MultipartCodec::new(),
    );
    let mut client = TcpStream::connect(client_addr).await.unwrap();

    // Arm: the save path is replaced by the per-series name
    client.write_all(b"Exposure /remote/run1/img.cbf\0").await.unwrap();
    let mut forwarded = vec![0u8; 64];
    let n = timeout(WAIT, camserver.read(&mut forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&forwarded[..n], b"Exposure scan0.cbf\0");

    camserver.write_all(b"15 OK Starting 0.1 second background\x18").await.unwrap();
    let mut relayed = vec![0u8; 64];
    let n = timeout(WAIT, client.read(&mut relayed)).await.unwrap().unwrap();
    assert_eq!(&relayed[..n], b"15 OK Starting 0.1 second background\x18");

    deliver(staging.path(), watched.path(), "scan0_00000.cbf", &cbf_file(3, 2, 1));
    deliver(staging.path(), watched.path(), "scan0_00001.cbf", &cbf_file(3, 2, 2));
    camserver
        .write_all(b"7 OK /remote/run1/scan0_00001.cbf\x18")
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < 4 {
        let message = timeout(WAIT, subscriber.next()).await.unwrap().unwrap().unwrap();
        received.push(message);
    }

    assert_eq!(
        header_json(&received[0]),
        json!({"htype": "header", "filename": "scan0.cbf", "save_path": "/remote/run1/img.cbf"})
    );
    assert!(received[0].payload.is_none());

    for (frame, message) in received[1..3].iter().enumerate() {
        assert_eq!(
            header_json(message),
            json!({"htype": "image", "frame": frame, "shape": [2, 3], "type": "int32", "compression": "cbf"})
        );
        let expected = cbf_file(3, 2, frame as u8 + 1);
        assert_eq!(message.payload.as_deref(), Some(expected.as_slice()));
    }
    assert_eq!(header_json(&received[3]), json!({"htype": "series_end"}));

    assert!(!watched.path().join("scan0_00000.cbf").exists());
    assert!(!watched.path().join("scan0_00001.cbf").exists());

    // Monitor sees the last image of the series
    let mut monitor = Framed::new(
        TcpStream::connect(monitor_server.local_addr()).await.unwrap(),
        MultipartCodec::new(),
    );
    monitor.send(Multipart::header_only("latest?")).await.unwrap();
    let latest = timeout(WAIT, monitor.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(header_json(&latest)["frame"], json!(1));
    assert_eq!(latest.payload, received[2].payload);

    drop(received);
    drop(latest);
    stop_tx.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();

    assert!(pool.is_closed());
    assert_eq!(pool.total_acquires(), 2);
    assert_eq!(pool.total_acquires(), pool.total_returns());
}

#[tokio::test]
async fn test_second_series_gets_next_scan_number() {
    let watched = TempDir::new().unwrap();
    let config = StreamerConfig {
        watch_folder: watched.path().to_path_buf(),
        format: SourceFormat::Tif,
        pool_size: 2,
        ..Default::default()
    };

    let camserver_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control = TcpStream::connect(camserver_listener.local_addr().unwrap())
        .await
        .unwrap();
    let (mut camserver, _) = camserver_listener.accept().await.unwrap();
    let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client_listener.local_addr().unwrap();
    let (_watch_tx, watch_events) = tokio::sync::mpsc::channel(1);
    let (_monitor_tx, monitor_requests) = tokio::sync::mpsc::channel(1);
    let (transport, mut published) = pilatus_streamer::transport::ChannelTransport::new(8);

    let streamer = Streamer::new(
        &config,
        BufferPool::new(2, 64),
        transport,
        StreamerIo {
            client_listener,
            control,
            watch_events,
            monitor_requests,
        },
    );
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(streamer.run(async {
        let _ = stop_rx.await;
    }));

    let mut buf = vec![0u8; 64];
    for (scan, request) in [
        &b"exposure /a/one.tif"[..],
        b"EXTTRIGGER /a/two.tif",
        b"extmtrigger /a/three.tif",
        b"ExtEnable /a/four.tif",
    ]
    .into_iter()
    .enumerate()
    {
        // A fresh connection per series; the previous client has left
        let mut client = TcpStream::connect(client_addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let n = timeout(WAIT, camserver.read(&mut buf)).await.unwrap().unwrap();
        let verb = std::str::from_utf8(request).unwrap().split(' ').next().unwrap();
        assert_eq!(
            &buf[..n],
            format!("{verb} scan{scan}.tif\0").as_bytes(),
        );

        let announced = timeout(WAIT, published.recv()).await.unwrap().unwrap();
        assert_eq!(header_json(&announced)["filename"], json!(format!("scan{scan}.tif")));
        drop(client);
    }

    stop_tx.send(()).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}
