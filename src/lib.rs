//! Camera frame pipeline and control channel for connected camera devices.
//!
//! camlink moves sensor frames to two kinds of consumers and keeps a
//! control connection to the device's server alive.
//!
//! # Features
//!
//! - **Explain uploads**: one frame is JPEG-encoded on its own thread and
//!   streamed chunk by chunk into a chunked `multipart/form-data` request
//!   while encoding is still running
//! - **Live view**: multipart MJPEG responder with JPEG passthrough and
//!   on-the-fly conversion of raw frames
//! - **Control channel**: websocket session with retry, heartbeat and
//!   reconnect on loss
//!
//! # Pipeline
//!
//! ```text
//! FrameSource -> FrameLease -> EncoderTask --chunk channel--> ChunkedUploadSender -> HTTP
//!            \-> LiveStreamResponder -> MultipartSink
//! ```
//!
//! ## Example (explain)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use camlink::{Camera, CameraConfig, FrameSource, ImageJpegEncoder};
//!
//! # async fn run(sensor: Arc<dyn FrameSource>) -> camlink::Result<()> {
//! let config = CameraConfig::default().with_explain("https://example.com/explain", "token");
//! let camera = Camera::with_reqwest(sensor, Arc::new(ImageJpegEncoder::default()), config)?;
//! camera.start()?;
//!
//! let answer = camera.explain("what is this?").await;
//! println!("{}", answer.to_json());
//! # Ok(())
//! # }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

// Settings
pub mod config;

// Frame pipeline
pub mod camera;
pub mod capture;
pub mod channel;
pub mod encoder;
pub mod stream;
pub mod upload;

// Control channel
pub mod connection;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use camera::{Camera, ExplainResponse};
pub use capture::{FrameLease, FrameSource};
pub use channel::{ChunkReceiver, ChunkSender, chunk_channel};
pub use config::{CameraConfig, ConnectionConfig};
pub use connection::{ConnectionManager, ConnectionState, ControlSession};
pub use encoder::{EncoderTask, ImageJpegEncoder, JpegEncoder};
pub use stream::{HttpReply, LiveStreamResponder, MultipartSink};
pub use upload::{ChunkedUploadSender, HttpConnector, ReqwestConnector, UploadRequest};
