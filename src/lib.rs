//! # Pilatus frame streamer
//!
//! Sits between a Pilatus detector's control server (camserver) and the rest
//! of a beamline's data pipeline:
//!
//! - relays one control client to camserver, rewriting arm commands so the
//!   detector writes into the watched folder under a per-series name
//! - picks up each finished image file, loads it into a pooled buffer and
//!   publishes it as a `[header, payload]` multipart message to every
//!   subscriber
//! - answers monitor requests with the most recent image
//! - announces the start and end of each series
//!
//! ## Crate structure
//!
//! - **`acquisition`**: series state (scan counter, armed/idle, series-end
//!   detection)
//! - **`control`**: arm-command recognition and rewrite, completion records,
//!   response framing
//! - **`transport`**: multipart wire codec and the TCP fan-out publisher
//! - **`publisher`**: frame to multipart conversion and latest-image retention
//! - **`monitor`**: request/reply server for the latest image
//! - **`watcher`**: rename-into-folder notifications
//! - **`orchestrator`**: the single event loop that drives everything
//! - **`tracing_setup`**: subscriber installation
//!
//! Buffers, configuration, errors and file decoding live in the `pilatus-pool`,
//! `pilatus-core` and `pilatus-formats` crates.

pub mod acquisition;
pub mod control;
pub mod monitor;
pub mod orchestrator;
pub mod publisher;
pub mod tracing_setup;
pub mod transport;
pub mod watcher;

pub use acquisition::{AcquisitionSession, AcquisitionState};
pub use orchestrator::{Streamer, StreamerIo};
pub use publisher::FramePublisher;
pub use transport::{FrameTransport, Multipart};
