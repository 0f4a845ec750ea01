//! Live stream responder

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::capture::{self, FrameLease, FrameSource};
use crate::encoder::JpegEncoder;
use crate::{CameraError, Result};

/// Destination of multipart parts, usually an open streaming HTTP response
#[async_trait]
pub trait MultipartSink: Send {
    /// Write bytes to the client; an error means the client is gone
    async fn write(&mut self, bytes: Bytes) -> Result<()>;
}

/// Feeds a channel whose receiver backs an HTTP response body
#[async_trait]
impl MultipartSink for mpsc::Sender<Bytes> {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.send(bytes).await.map_err(|_| CameraError::channel_closed("stream client disconnected"))
    }
}

/// Shared on/off flag for the live stream
#[derive(Debug, Clone, Default)]
pub struct StreamSwitch(Arc<AtomicBool>);

impl StreamSwitch {
    /// Turn streaming on; returns the previous state
    pub fn turn_on(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }

    /// Turn streaming off; returns the previous state
    pub fn turn_off(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    /// Whether streaming is on
    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tuning of the live stream loop
#[derive(Debug, Clone)]
pub struct LiveStreamSettings {
    /// Multipart boundary (without leading dashes)
    pub boundary: String,
    /// JPEG quality used when the sensor delivers raw frames
    pub quality: u8,
    /// Minimum spacing between two parts
    pub frame_interval: Duration,
    /// Wait before retrying after the sensor had no frame
    pub retry_delay: Duration,
    /// Log every n-th consecutive underrun
    pub underrun_log_every: u32,
}

impl Default for LiveStreamSettings {
    fn default() -> Self {
        Self {
            boundary: "frame".to_string(),
            quality: 80,
            frame_interval: Duration::from_millis(10),
            retry_delay: Duration::from_millis(10),
            underrun_log_every: 50,
        }
    }
}

/// Why a stream loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamEnd {
    /// Streaming flag was cleared
    #[default]
    Stopped,
    /// Writing to the client failed
    ClientDisconnected,
}

/// Counters for one stream session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Parts written completely
    pub frames: u64,
    /// JPEG payload bytes written
    pub bytes: u64,
    /// Capture attempts that returned no frame
    pub underruns: u64,
    /// How the loop ended
    pub ended: StreamEnd,
}

/// Part header: boundary line plus content headers and the blank line
pub fn part_header(boundary: &str, len: usize) -> String {
    format!("--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

/// Pulls frames in a loop and writes each one as a multipart part
pub struct LiveStreamResponder {
    source: Arc<dyn FrameSource>,
    encoder: Arc<dyn JpegEncoder>,
    switch: StreamSwitch,
    settings: LiveStreamSettings,
}

impl LiveStreamResponder {
    /// Create a responder driven by `switch`
    pub fn new(
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn JpegEncoder>,
        switch: StreamSwitch,
        settings: LiveStreamSettings,
    ) -> Self {
        Self { source, encoder, switch, settings }
    }

    /// Stream until the switch is turned off or the client goes away.
    ///
    /// A missing frame is retried after a short delay. A failed JPEG
    /// conversion ends the stream with an error.
    pub async fn run(&self, sink: &mut dyn MultipartSink) -> Result<StreamSummary> {
        info!(boundary = %self.settings.boundary, "Live stream started");

        let mut summary = StreamSummary::default();
        let mut empty_count: u32 = 0;
        let period = self.settings.frame_interval.max(Duration::from_millis(1));
        let mut pacing = interval_at(Instant::now() + period, period);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.switch.is_on() {
            let (lease, jpeg) = match self.grab().await {
                Ok(grabbed) => grabbed,
                Err(CameraError::Capture { reason }) => {
                    empty_count += 1;
                    summary.underruns += 1;
                    if empty_count % self.settings.underrun_log_every.max(1) == 0 {
                        warn!("No frame from sensor {} times in a row: {}", empty_count, reason);
                    }
                    tokio::time::sleep(self.settings.retry_delay).await;
                    continue;
                }
                Err(e) => {
                    error!("Live stream conversion failed: {}", e);
                    return Err(e);
                }
            };
            empty_count = 0;

            let len = jpeg.len();
            let written = self.write_part(sink, jpeg).await;
            lease.release();

            if let Err(e) = written {
                info!(frames = summary.frames, "Live stream client disconnected: {}", e);
                summary.ended = StreamEnd::ClientDisconnected;
                return Ok(summary);
            }
            summary.frames += 1;
            summary.bytes += len as u64;

            pacing.tick().await;
        }

        info!(frames = summary.frames, underruns = summary.underruns, "Live stream stopped");
        summary.ended = StreamEnd::Stopped;
        Ok(summary)
    }

    async fn grab(&self) -> Result<(FrameLease, Bytes)> {
        let source = Arc::clone(&self.source);
        let encoder = Arc::clone(&self.encoder);
        let quality = self.settings.quality;
        tokio::task::spawn_blocking(move || grab_jpeg(&source, encoder.as_ref(), quality))
            .await
            .map_err(|e| CameraError::encode_failed(format!("capture thread failed: {e}")))?
    }

    async fn write_part(&self, sink: &mut dyn MultipartSink, jpeg: Bytes) -> Result<()> {
        let header = part_header(&self.settings.boundary, jpeg.len());
        sink.write(Bytes::from(header)).await?;
        sink.write(jpeg).await?;
        sink.write(Bytes::from_static(b"\r\n")).await
    }
}

/// Acquire one frame and make sure it is JPEG
pub(crate) fn grab_jpeg(
    source: &Arc<dyn FrameSource>,
    encoder: &dyn JpegEncoder,
    quality: u8,
) -> Result<(FrameLease, Bytes)> {
    let lease = capture::acquire(source)?;
    let jpeg = if lease.is_jpeg() {
        lease.data.clone()
    } else {
        encoder.encode_to_bytes(&lease, quality)?
    };
    debug!(sequence = lease.sequence, len = jpeg.len(), "Frame ready for live view");
    Ok((lease, jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockFrameSource, RecordingSink, ScriptedEncoder};

    fn responder(mock: &Arc<MockFrameSource>, encoder: ScriptedEncoder) -> (LiveStreamResponder, StreamSwitch) {
        let switch = StreamSwitch::default();
        switch.turn_on();
        let settings = LiveStreamSettings {
            frame_interval: Duration::from_millis(1),
            retry_delay: Duration::from_millis(1),
            ..LiveStreamSettings::default()
        };
        let responder =
            LiveStreamResponder::new(mock.clone(), Arc::new(encoder), switch.clone(), settings);
        (responder, switch)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parts_are_framed_and_frames_released() {
        let _ = tracing_subscriber::fmt::try_init();

        let mock = Arc::new(MockFrameSource::rgb565(4, 4));
        let (responder, switch) = responder(&mock, ScriptedEncoder::new(2, 5));
        let mut sink = RecordingSink::stop_after(3, switch.clone());

        let summary = responder.run(&mut sink).await.unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.bytes, 30);
        assert_eq!(summary.ended, StreamEnd::Stopped);
        assert_eq!(mock.outstanding(), 0);

        let expected_part = {
            let mut part = part_header("frame", 10).into_bytes();
            part.extend_from_slice(&ScriptedEncoder::new(2, 5).expected_output());
            part.extend_from_slice(b"\r\n");
            part
        };
        assert_eq!(sink.bytes(), expected_part.repeat(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn jpeg_frames_are_not_reencoded() {
        let mock = Arc::new(MockFrameSource::jpeg(vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]));
        let encoder = ScriptedEncoder::new(1, 1);
        let calls = encoder.calls();
        let (responder, switch) = responder(&mock, encoder);
        let mut sink = RecordingSink::stop_after(2, switch);

        responder.run(&mut sink).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(sink.bytes().windows(5).any(|w| w == [0xFF, 0xD8, 0x01, 0xFF, 0xD9]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_disconnect_ends_stream_immediately() {
        let mock = Arc::new(MockFrameSource::rgb565(4, 4));
        let (responder, _switch) = responder(&mock, ScriptedEncoder::new(1, 4));
        let (mut tx, rx) = mpsc::channel::<Bytes>(8);
        drop(rx);

        let summary = responder.run(&mut tx).await.unwrap();

        assert_eq!(summary.frames, 0);
        assert_eq!(summary.ended, StreamEnd::ClientDisconnected);
        assert_eq!(mock.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn underruns_are_retried_not_fatal() {
        let mock = Arc::new(MockFrameSource::rgb565(4, 4));
        mock.fail_next(60);
        let (responder, switch) = responder(&mock, ScriptedEncoder::new(1, 4));
        let mut sink = RecordingSink::stop_after(1, switch);

        let summary = responder.run(&mut sink).await.unwrap();

        assert_eq!(summary.underruns, 60);
        assert_eq!(summary.frames, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conversion_failure_is_an_error() {
        let mock = Arc::new(MockFrameSource::rgb565(4, 4));
        let (responder, _switch) = responder(&mock, ScriptedEncoder::new(4, 4).failing_after(0));
        let mut sink = RecordingSink::stop_after(5, StreamSwitch::default());

        let result = responder.run(&mut sink).await;

        assert!(matches!(result, Err(CameraError::Encode { .. })));
        assert_eq!(mock.outstanding(), 0);
    }
}
