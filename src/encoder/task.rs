//! Background encode pass feeding the chunk channel

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::JpegEncoder;
use crate::capture::FrameLease;
use crate::channel::ChunkSender;
use crate::types::Chunk;
use crate::{CameraError, Result};

/// Summary of one finished encode pass
#[derive(Debug)]
pub struct EncodeReport {
    /// Data chunks pushed into the channel
    pub chunks: usize,
    /// Encoded bytes pushed into the channel
    pub bytes: usize,
    /// Time spent encoding, including backpressure waits
    pub elapsed: Duration,
    /// Encoder outcome; the end marker is sent either way
    pub outcome: Result<()>,
}

/// Handle to one running encode pass.
///
/// The pass owns its frame lease and its channel sender. It always finishes
/// with [`Chunk::End`], and releases the frame when it exits.
#[derive(Debug)]
pub struct EncoderTask {
    handle: Option<JoinHandle<EncodeReport>>,
}

impl EncoderTask {
    /// Start encoding `frame` on a dedicated blocking thread
    pub fn spawn(
        frame: FrameLease,
        encoder: Arc<dyn JpegEncoder>,
        quality: u8,
        chunks: ChunkSender,
    ) -> Self {
        let handle =
            tokio::task::spawn_blocking(move || encode_pass(frame, encoder, quality, chunks));
        Self { handle: Some(handle) }
    }

    /// Wait for the encode thread to exit.
    ///
    /// Safe to call again after a cancelled wait; once joined, further calls
    /// return an error.
    pub async fn join(&mut self) -> Result<EncodeReport> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(CameraError::encode_failed("encoder task already joined"));
        };
        let joined = handle.await;
        self.handle = None;
        joined.map_err(|e| CameraError::encode_failed(format!("encoder thread failed: {e}")))
    }

    /// Whether the task has already been joined
    pub fn is_joined(&self) -> bool {
        self.handle.is_none()
    }
}

fn encode_pass(
    frame: FrameLease,
    encoder: Arc<dyn JpegEncoder>,
    quality: u8,
    chunks: ChunkSender,
) -> EncodeReport {
    let started = Instant::now();
    let mut count = 0;
    let mut bytes = 0;

    let outcome = encoder.encode(&frame, quality, &mut |piece| {
        chunks.send_blocking(Chunk::copy_from(piece))?;
        count += 1;
        bytes += piece.len();
        Ok(())
    });

    if let Err(e) = &outcome {
        warn!(sequence = frame.sequence, "JPEG encode stopped early: {}", e);
    }

    // End marker goes out unconditionally so the consumer never waits forever
    if chunks.finish_blocking().is_err() {
        debug!("Chunk consumer gone before end-of-stream marker");
    }

    debug!(
        sequence = frame.sequence,
        chunks = count,
        bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Encode pass finished"
    );
    frame.release();

    EncodeReport { chunks: count, bytes, elapsed: started.elapsed(), outcome }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{self, FrameSource};
    use crate::channel::chunk_channel;
    use crate::test_utils::{MockFrameSource, ScriptedEncoder};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn encode_pass_streams_chunks_then_end_and_releases_frame() {
        let _ = tracing_subscriber::fmt::try_init();

        let mock = Arc::new(MockFrameSource::rgb565(8, 8));
        let source: Arc<dyn FrameSource> = mock.clone();
        let lease = capture::acquire(&source).unwrap();

        let (tx, mut rx) = chunk_channel(2);
        let mut task = EncoderTask::spawn(lease, Arc::new(ScriptedEncoder::new(6, 100)), 50, tx);

        let mut total = 0;
        while let Chunk::Data(bytes) = rx.recv().await {
            total += bytes.len();
        }
        let report = task.join().await.unwrap();

        assert_eq!(total, 600);
        assert_eq!(report.chunks, 6);
        assert_eq!(report.bytes, 600);
        assert!(report.outcome.is_ok());
        assert_eq!(mock.outstanding(), 0);
        assert!(task.is_joined());
        assert!(task.join().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_encode_still_sends_end_marker() {
        let mock = Arc::new(MockFrameSource::rgb565(8, 8));
        let source: Arc<dyn FrameSource> = mock.clone();
        let lease = capture::acquire(&source).unwrap();

        let (tx, mut rx) = chunk_channel(4);
        let encoder = ScriptedEncoder::new(10, 16).failing_after(3);
        let mut task = EncoderTask::spawn(lease, Arc::new(encoder), 50, tx);

        let freed = rx.drain().await;
        let report = task.join().await.unwrap();

        assert_eq!(freed, 3);
        assert!(matches!(report.outcome, Err(CameraError::Encode { .. })));
        assert_eq!(mock.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_consumer_stops_encoder() {
        let mock = Arc::new(MockFrameSource::rgb565(8, 8));
        let source: Arc<dyn FrameSource> = mock.clone();
        let lease = capture::acquire(&source).unwrap();

        let (tx, rx) = chunk_channel(1);
        drop(rx);
        let mut task = EncoderTask::spawn(lease, Arc::new(ScriptedEncoder::new(50, 16)), 50, tx);

        let report = task.join().await.unwrap();
        assert_eq!(report.chunks, 0);
        assert!(matches!(report.outcome, Err(CameraError::ChannelClosed { .. })));
        assert_eq!(mock.outstanding(), 0);
    }
}
