//! Chunked upload sender
//!
//! Forwards encoder output from a [`ChunkReceiver`] into an opened
//! [`UploadRequest`]. Whatever happens to the request, the sender drains the
//! channel to its end marker and joins the encoder before returning, so no
//! chunk is left behind and no encoder thread outlives the call.

use tracing::{debug, error, info, warn};

use super::{UPLOAD_SUCCESS_STATUS, UploadRequest, multipart};
use crate::channel::ChunkReceiver;
use crate::encoder::EncoderTask;
use crate::types::Chunk;
use crate::{CameraError, Result};

/// Form fields of one explain upload
#[derive(Debug, Clone, Copy)]
pub struct UploadForm<'a> {
    /// Question text sent as the `question` field
    pub question: &'a str,
    /// Multipart boundary, fixed for the request
    pub boundary: &'a str,
    /// File name announced for the `file` part
    pub file_name: &'a str,
}

/// Successful upload result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Response status (always the success status)
    pub status: u16,
    /// Response body, unmodified
    pub body: String,
    /// JPEG bytes forwarded to the server
    pub jpeg_bytes: usize,
    /// JPEG chunks forwarded to the server
    pub jpeg_chunks: usize,
}

/// Streams one encode pass into one request
pub struct ChunkedUploadSender {
    request: Box<dyn UploadRequest>,
}

impl ChunkedUploadSender {
    /// Wrap a request whose headers are already set
    pub fn new(request: Box<dyn UploadRequest>) -> Self {
        Self { request }
    }

    /// Open the request and stream the form, JPEG chunks included.
    ///
    /// Returns:
    /// - `Ok(receipt)` - server answered with the success status
    /// - `Err(CameraError::Connection)` - the request could not be opened
    /// - `Err(CameraError::Io)` - a write or read failed mid-request
    /// - `Err(CameraError::Encode)` - the encoder failed, body is incomplete
    /// - `Err(CameraError::UploadStatus)` - server rejected the upload
    ///
    /// In every case the channel has been drained and `encoder` joined.
    pub async fn send(
        mut self,
        url: &str,
        form: UploadForm<'_>,
        chunks: &mut ChunkReceiver,
        encoder: &mut EncoderTask,
    ) -> Result<UploadReceipt> {
        if let Err(e) = self.request.open("POST", url).await {
            error!("Failed to connect to explain URL: {}", e);
            let freed = chunks.drain().await;
            match join_encoder(encoder).await {
                Some(report) => match report.outcome {
                    Ok(()) => debug!(
                        freed,
                        chunks = report.chunks,
                        "Discarded encoder output after failed open"
                    ),
                    Err(encode) => warn!(
                        freed,
                        chunks = report.chunks,
                        "Encoder also failed after failed open: {}", encode
                    ),
                },
                None => debug!(freed, "Discarded encoder output after failed open"),
            }
            return Err(e);
        }

        let streamed = self.stream_body(form, chunks).await;

        // Drain whatever the failed stream left, then make sure the encoder is done
        let freed = chunks.drain().await;
        if freed > 0 {
            debug!(freed, "Discarded undelivered chunks");
        }
        let report = join_encoder(encoder).await;

        let (jpeg_bytes, jpeg_chunks) = match streamed {
            Ok(counts) => counts,
            Err(e) => {
                self.request.close().await;
                return Err(e);
            }
        };

        if let Some(Err(e)) = report.map(|r| r.outcome) {
            warn!("Encoder failed, abandoning upload: {}", e);
            self.request.close().await;
            return Err(e);
        }

        if let Err(e) = self.finish_body(form).await {
            self.request.close().await;
            return Err(e);
        }

        let status = match self.request.status_code().await {
            Ok(status) => status,
            Err(e) => {
                self.request.close().await;
                return Err(e);
            }
        };
        if status != UPLOAD_SUCCESS_STATUS {
            error!(status, "Failed to upload photo");
            self.request.close().await;
            return Err(CameraError::UploadStatus { status });
        }

        let body = self.request.read_all().await;
        self.request.close().await;
        let body = body?;

        info!(jpeg_bytes, jpeg_chunks, status, "Explain upload finished");
        Ok(UploadReceipt { status, body, jpeg_bytes, jpeg_chunks })
    }

    /// Preamble plus every JPEG chunk up to the end marker
    async fn stream_body(
        &mut self,
        form: UploadForm<'_>,
        chunks: &mut ChunkReceiver,
    ) -> Result<(usize, usize)> {
        let question = multipart::text_field(form.boundary, "question", form.question);
        self.write(question.as_bytes(), "question field").await?;

        let header = multipart::file_part_header(form.boundary, "file", form.file_name);
        self.write(header.as_bytes(), "file part header").await?;

        let mut total_sent = 0;
        let mut count = 0;
        loop {
            match chunks.recv().await {
                Chunk::Data(bytes) => {
                    self.write(&bytes, "JPEG chunk").await?;
                    total_sent += bytes.len();
                    count += 1;
                }
                Chunk::End => break,
            }
        }
        Ok((total_sent, count))
    }

    /// Closing boundary, then the zero-length terminal chunk
    async fn finish_body(&mut self, form: UploadForm<'_>) -> Result<()> {
        let footer = multipart::closing_boundary(form.boundary);
        self.write(footer.as_bytes(), "closing boundary").await?;
        self.write(&[], "terminal chunk").await
    }

    async fn write(&mut self, data: &[u8], what: &str) -> Result<()> {
        self.request.write(data).await.map_err(|e| {
            warn!("Upload write failed ({}): {}", what, e);
            e
        })
    }
}

/// Join the encoder if it is still running; `None` if it was joined before
async fn join_encoder(encoder: &mut EncoderTask) -> Option<crate::encoder::EncodeReport> {
    if encoder.is_joined() {
        return None;
    }
    match encoder.join().await {
        Ok(report) => Some(report),
        Err(e) => {
            error!("Encoder thread did not exit cleanly: {}", e);
            None
        }
    }
}
