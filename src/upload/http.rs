//! `reqwest` backed upload request
//!
//! The request body is a stream fed from a small in-memory channel: each
//! `write` pushes one piece, and the zero-length write closes the stream.
//! `reqwest` sends a streamed body with chunked transfer framing, so the
//! `Transfer-Encoding` header set by callers is left to the client.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{HttpConnector, UploadRequest};
use crate::{CameraError, Result};

/// Pieces buffered between `write` and the HTTP client
const BODY_BUFFER: usize = 4;

/// Creates [`ReqwestUpload`] requests sharing one connection pool
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    client: reqwest::Client,
}

impl ReqwestConnector {
    /// Build a connector whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CameraError::config(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { client })
    }

    /// Use an already configured client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpConnector for ReqwestConnector {
    fn create(&self) -> Box<dyn UploadRequest> {
        Box::new(ReqwestUpload::new(self.client.clone()))
    }
}

/// One streamed HTTP request
#[derive(Debug)]
pub struct ReqwestUpload {
    client: reqwest::Client,
    headers: HeaderMap,
    body: Option<mpsc::Sender<io::Result<Bytes>>>,
    in_flight: Option<JoinHandle<reqwest::Result<reqwest::Response>>>,
    response: Option<reqwest::Response>,
}

impl ReqwestUpload {
    /// Create an unopened request
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, headers: HeaderMap::new(), body: None, in_flight: None, response: None }
    }

    /// Resolve the in-flight request into a response
    async fn await_response(&mut self) -> Result<&mut reqwest::Response> {
        if self.response.is_none() {
            let Some(handle) = self.in_flight.take() else {
                return Err(CameraError::io("response read on unopened request"));
            };
            let response = handle
                .await
                .map_err(|e| CameraError::io_with_source("HTTP request task", e))?
                .map_err(map_reqwest_error)?;
            self.response = Some(response);
        }
        match self.response.as_mut() {
            Some(response) => Ok(response),
            None => Err(CameraError::io("response missing")),
        }
    }

    /// Explain why the body stream stopped accepting data
    ///
    /// The body receiver is gone at this point, so the request task is
    /// about to resolve with the real cause.
    async fn body_failure(&mut self) -> CameraError {
        self.body = None;
        let Some(handle) = self.in_flight.take() else {
            return CameraError::io("request body stream closed");
        };
        match handle.await {
            Ok(Err(e)) => map_reqwest_error(e),
            Ok(Ok(response)) => {
                // Server answered before reading the whole body
                self.response = Some(response);
                CameraError::io("server closed request body early")
            }
            Err(e) => CameraError::io_with_source("HTTP request task", e),
        }
    }
}

#[async_trait]
impl UploadRequest for ReqwestUpload {
    fn set_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("transfer-encoding") {
            return;
        }
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!("Ignoring invalid header {}", name),
        }
    }

    async fn open(&mut self, method: &str, url: &str) -> Result<()> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| CameraError::connection_failed_with_source("invalid HTTP method", e))?;
        let url = reqwest::Url::parse(url).map_err(|e| {
            CameraError::connection_failed_with_source(format!("invalid URL {url}"), e)
        })?;

        let (tx, rx) = mpsc::channel(BODY_BUFFER);
        let request = self
            .client
            .request(method, url.clone())
            .headers(self.headers.clone())
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));

        debug!(%url, "Opening streamed request");
        self.body = Some(tx);
        self.in_flight = Some(tokio::spawn(request.send()));
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            // Dropping the sender ends the body stream and its chunked framing
            self.body = None;
            return Ok(());
        }
        let Some(body) = self.body.as_ref() else {
            return Err(CameraError::io("write after body end"));
        };
        if body.send(Ok(Bytes::copy_from_slice(data))).await.is_err() {
            return Err(self.body_failure().await);
        }
        Ok(())
    }

    async fn status_code(&mut self) -> Result<u16> {
        self.body = None;
        Ok(self.await_response().await?.status().as_u16())
    }

    async fn read_all(&mut self) -> Result<String> {
        self.await_response().await?;
        let Some(response) = self.response.take() else {
            return Err(CameraError::io("response missing"));
        };
        response.text().await.map_err(|e| CameraError::io_with_source("read response body", e))
    }

    async fn close(&mut self) {
        self.body = None;
        self.response = None;
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> CameraError {
    if e.is_connect() || e.is_builder() {
        CameraError::connection_failed_with_source("HTTP connection failed", e)
    } else if e.is_timeout() {
        CameraError::io_with_source("HTTP request timed out", e)
    } else {
        CameraError::io_with_source("HTTP request", e)
    }
}
