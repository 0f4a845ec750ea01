//! HTTP replies for the live view endpoints

use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, warn};

use super::responder::grab_jpeg;
use crate::CameraError;
use crate::capture::FrameSource;
use crate::encoder::JpegEncoder;

/// Status, content type and body of a non-streaming reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl HttpReply {
    /// Plain text reply
    pub fn text(status: u16, body: &'static str) -> Self {
        Self { status, content_type: "text/plain", body: Bytes::from_static(body.as_bytes()) }
    }

    /// JPEG image reply
    pub fn jpeg(body: Bytes) -> Self {
        Self { status: 200, content_type: "image/jpeg", body }
    }

    /// 503 for a stream request while streaming is off
    pub fn camera_not_started() -> Self {
        Self::text(503, "Camera not started")
    }

    /// 500 for a failed conversion
    pub fn internal_error() -> Self {
        Self::text(500, "Internal Server Error")
    }

    /// Reply for an error that ended a live stream or snapshot
    pub fn from_error(error: &CameraError) -> Self {
        match error {
            CameraError::Capture { .. } => Self::text(503, "Frame not ready"),
            _ => Self::internal_error(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Headers that open a multipart live stream response
pub fn stream_response_headers(boundary: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Content-Type", format!("multipart/x-mixed-replace; boundary={boundary}")),
        ("Cache-Control", "no-cache, no-store, must-revalidate".to_string()),
        ("Pragma", "no-cache".to_string()),
        ("Connection", "close".to_string()),
    ]
}

/// Grab one frame and reply with it as JPEG
pub async fn snapshot(
    source: Arc<dyn FrameSource>,
    encoder: Arc<dyn JpegEncoder>,
    quality: u8,
) -> HttpReply {
    let grabbed =
        tokio::task::spawn_blocking(move || grab_jpeg(&source, encoder.as_ref(), quality)).await;
    match grabbed {
        Ok(Ok((lease, jpeg))) => {
            lease.release();
            HttpReply::jpeg(jpeg)
        }
        Ok(Err(e)) => {
            warn!("Snapshot failed: {}", e);
            HttpReply::from_error(&e)
        }
        Err(e) => {
            error!("Snapshot thread failed: {}", e);
            HttpReply::internal_error()
        }
    }
}
