//! Explain upload: network collaborator seam, multipart framing and sender
//!
//! The upload body is `multipart/form-data` with two parts, a `question`
//! text field and a `file` JPEG field. The JPEG part is written chunk by
//! chunk as the encoder produces it, over a request opened with chunked
//! transfer framing, so the full image is never held in memory.

mod http;
pub mod multipart;
mod sender;

pub use http::{ReqwestConnector, ReqwestUpload};
pub use sender::{ChunkedUploadSender, UploadForm, UploadReceipt};

use async_trait::async_trait;

use crate::Result;

/// Status code the explain server answers with on success
pub const UPLOAD_SUCCESS_STATUS: u16 = 200;

/// One outgoing HTTP request with a streamed body
///
/// Mirrors the device HTTP client: headers are set before
/// [`open`](UploadRequest::open), the body is written in pieces and a
/// zero-length write terminates the chunked framing.
#[async_trait]
pub trait UploadRequest: Send {
    /// Add a request header; must be called before `open`
    fn set_header(&mut self, name: &str, value: &str);

    /// Connect and send the request line and headers
    async fn open(&mut self, method: &str, url: &str) -> Result<()>;

    /// Write a piece of the body. An empty slice ends the body.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the response status
    async fn status_code(&mut self) -> Result<u16>;

    /// Read the whole response body as text
    async fn read_all(&mut self) -> Result<String>;

    /// Tear down the request; safe to call more than once
    async fn close(&mut self);
}

/// Factory for upload requests
pub trait HttpConnector: Send + Sync + 'static {
    /// Create a fresh, unopened request
    fn create(&self) -> Box<dyn UploadRequest>;
}
