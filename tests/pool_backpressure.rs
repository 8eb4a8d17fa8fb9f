//! Buffer accounting across the publish path: retained images, slow
//! subscribers and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use pilatus_core::{Compression, DetectorFrame, MessageHeader};
use pilatus_pool::{BufferPool, PoolError};
use pilatus_streamer::transport::ChannelTransport;
use pilatus_streamer::FramePublisher;
use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

fn frame(pool: &BufferPool, number: u32) -> DetectorFrame {
    let mut payload = pool.try_acquire().unwrap();
    payload.copy_from_slice(&number.to_le_bytes()).unwrap();
    DetectorFrame {
        frame_number: number,
        width: 1,
        height: 1,
        payload,
        compression: Compression::None,
    }
}

#[tokio::test]
async fn test_acquire_waits_for_published_buffers() {
    let pool = BufferPool::new(2, 8);
    let (transport, mut rx) = ChannelTransport::new(4);
    let mut publisher = FramePublisher::new(transport);

    publisher.publish(frame(&pool, 0)).await.unwrap();
    publisher.publish(frame(&pool, 1)).await.unwrap();
    assert_eq!(pool.available(), 0);

    let mut acquire = task::spawn(pool.acquire());
    assert_pending!(acquire.poll());

    // Frame 0 is no longer retained; its buffer returns once the queued
    // copy is consumed.
    let first = rx.recv().await.unwrap();
    assert!(!acquire.is_woken());
    drop(first);
    assert!(acquire.is_woken());
    let buffer = assert_ready_ok!(acquire.poll());
    assert_eq!(buffer.len(), 0);

    // Frame 1 is both queued and retained for the monitor
    drop(rx.recv().await.unwrap());
    assert_eq!(pool.available(), 0);
    assert_eq!(
        MessageHeader::from_json_bytes(&publisher.monitor_reply().header).unwrap(),
        MessageHeader::Image {
            frame: 1,
            shape: [1, 1],
            element_type: pilatus_core::ElementType::Int32,
            compression: Compression::None,
        }
    );

    drop(buffer);
    publisher.clear_latest();
    assert_eq!(pool.available(), 2);
    assert_eq!(pool.total_acquires(), pool.total_returns());
}

#[tokio::test]
async fn test_shutdown_wakes_waiting_acquire() {
    let pool = BufferPool::new(1, 8);
    let held = pool.try_acquire().unwrap();

    let mut acquire = task::spawn(pool.acquire());
    assert_pending!(acquire.poll());

    pool.shutdown();
    assert!(acquire.is_woken());
    let result = assert_ready!(acquire.poll());
    assert!(matches!(result, Err(PoolError::Closed)));

    drop(held);
    assert_eq!(pool.outstanding(), 0);
}
