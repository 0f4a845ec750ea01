//! Camera facade: explain uploads, stable capture and live view control

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::capture::{self, FrameLease, FrameSource};
use crate::channel::chunk_channel;
use crate::config::CameraConfig;
use crate::encoder::{EncoderTask, ImageJpegEncoder, JpegEncoder};
use crate::stream::{
    self, HttpReply, LiveStreamResponder, LiveStreamSettings, MultipartSink, StreamSummary,
    StreamSwitch,
};
use crate::upload::{ChunkedUploadSender, HttpConnector, ReqwestConnector, UploadForm, multipart};
use crate::{CameraError, Result};

/// Frames grabbed back to back by a capture; the last one is kept
const STABLE_CAPTURE_FRAMES: usize = 2;

/// Shortest pause between two live view parts
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(10);

/// Result of [`Camera::explain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExplainResponse {
    /// Server answer, body passed through unchanged
    Answer(String),
    /// Failure message for the caller
    Failure(String),
}

#[derive(Serialize)]
struct FailureBody<'a> {
    success: bool,
    message: &'a str,
}

impl ExplainResponse {
    fn failure(error: &CameraError) -> Self {
        ExplainResponse::Failure(error.failure_message().to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExplainResponse::Answer(_))
    }

    /// JSON text handed back to the caller
    pub fn to_json(&self) -> String {
        match self {
            ExplainResponse::Answer(body) => body.clone(),
            ExplainResponse::Failure(message) => {
                serde_json::to_string(&FailureBody { success: false, message })
                    .unwrap_or_else(|_| r#"{"success":false}"#.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ExplainTarget {
    url: String,
    token: String,
}

/// One camera: sensor, encoder and explain client.
///
/// At most one encoder runs per camera; a new `explain` waits for the
/// previous encode to be joined before it starts.
pub struct Camera {
    source: Arc<dyn FrameSource>,
    encoder: Arc<dyn JpegEncoder>,
    http: Arc<dyn HttpConnector>,
    config: CameraConfig,
    target: Mutex<ExplainTarget>,
    captured: Mutex<Option<FrameLease>>,
    encoder_slot: tokio::sync::Mutex<Option<EncoderTask>>,
    started: AtomicBool,
    streaming: StreamSwitch,
    stream_fps: AtomicU32,
}

impl Camera {
    pub fn new(
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn JpegEncoder>,
        http: Arc<dyn HttpConnector>,
        config: CameraConfig,
    ) -> Self {
        let target = ExplainTarget {
            url: config.explain_url.clone(),
            token: config.explain_token.clone(),
        };
        let stream_fps = AtomicU32::new(config.stream_fps);
        Self {
            source,
            encoder,
            http,
            config,
            target: Mutex::new(target),
            captured: Mutex::new(None),
            encoder_slot: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            streaming: StreamSwitch::default(),
            stream_fps,
        }
    }

    /// Camera uploading through a `reqwest` client
    pub fn with_reqwest(
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn JpegEncoder>,
        config: CameraConfig,
    ) -> Result<Self> {
        let http = ReqwestConnector::new(config.upload_timeout())?;
        Ok(Self::new(source, encoder, Arc::new(http), config))
    }

    /// Camera with the `image` JPEG encoder and a `reqwest` client, both
    /// sized from `config`
    pub fn from_config(source: Arc<dyn FrameSource>, config: CameraConfig) -> Result<Self> {
        let encoder = Arc::new(ImageJpegEncoder::new(config.chunk_size));
        Self::with_reqwest(source, encoder, config)
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Set the explain endpoint and its bearer token
    pub fn set_explain_url(&self, url: impl Into<String>, token: impl Into<String>) {
        *lock(&self.target) = ExplainTarget { url: url.into(), token: token.into() };
    }

    /// Power up the sensor
    pub fn start(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.source.start()?;
        self.started.store(true, Ordering::Release);
        info!("Camera started");
        Ok(())
    }

    /// Stop streaming, drop any held frame and power down the sensor
    pub fn stop(&self) {
        if self.streaming.turn_off() {
            info!("Live stream stopped by camera shutdown");
        }
        if let Some(lease) = lock(&self.captured).take() {
            lease.release();
        }
        if self.started.swap(false, Ordering::AcqRel) {
            self.source.stop();
            info!("Camera stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Capture a stable frame and hold it for the next `explain`.
    ///
    /// Waits for a running encoder first so the held frame is never
    /// replaced under it.
    pub async fn capture(&self) -> Result<()> {
        self.join_previous_encoder().await;
        let lease = self.capture_stable().await?;
        let previous = lock(&self.captured).replace(lease);
        drop(previous);
        Ok(())
    }

    /// Upload a frame with `question` and return the server's answer.
    ///
    /// Uses the frame held by [`capture`](Camera::capture) if there is one,
    /// otherwise captures a fresh one. Never spawns an encoder when no
    /// explain URL is set.
    pub async fn explain(&self, question: &str) -> ExplainResponse {
        let target = lock(&self.target).clone();
        if target.url.is_empty() {
            warn!("Explain requested without an explain URL");
            return ExplainResponse::failure(&CameraError::config("explain URL is not set"));
        }

        // Held for the whole upload: one encoder per camera
        let mut slot = self.encoder_slot.lock().await;
        if let Some(previous) = slot.as_mut() {
            join_encoder(previous).await;
        }

        let held = lock(&self.captured).take();
        let lease = match held {
            Some(lease) => lease,
            None => match self.capture_stable().await {
                Ok(lease) => lease,
                Err(e) => {
                    error!("Explain capture failed: {}", e);
                    return ExplainResponse::failure(&e);
                }
            },
        };
        let (width, height) = (lease.width, lease.height);

        let (chunks_tx, mut chunks) = chunk_channel(self.config.channel_capacity);
        let task = slot.insert(EncoderTask::spawn(
            lease,
            Arc::clone(&self.encoder),
            self.config.upload_quality,
            chunks_tx,
        ));

        let mut request = self.http.create();
        request.set_header("Device-Id", &self.config.device_id);
        request.set_header("Client-Id", &self.config.client_id);
        if !target.token.is_empty() {
            request.set_header("Authorization", &format!("Bearer {}", target.token));
        }
        request.set_header(
            "Content-Type",
            &multipart::form_data_content_type(&self.config.upload_boundary),
        );
        request.set_header("Transfer-Encoding", "chunked");

        let form = UploadForm {
            question,
            boundary: &self.config.upload_boundary,
            file_name: &self.config.upload_file_name,
        };
        let sent = ChunkedUploadSender::new(request).send(&target.url, form, &mut chunks, task).await;

        match sent {
            Ok(receipt) => {
                info!(
                    width,
                    height,
                    compressed = receipt.jpeg_bytes,
                    question,
                    result = %receipt.body,
                    "Explain image"
                );
                ExplainResponse::Answer(receipt.body)
            }
            Err(e) => {
                error!(width, height, question, "Explain failed: {}", e);
                ExplainResponse::failure(&e)
            }
        }
    }

    /// Turn the live view on at `fps` frames per second.
    ///
    /// Returns true when streaming is on afterwards. Fails when the camera
    /// is not started.
    pub async fn start_streaming(&self, fps: u32) -> bool {
        if self.streaming.is_on() {
            warn!("Live stream already running");
            return true;
        }
        if !self.is_started() {
            error!("Camera not started, cannot start live stream");
            return false;
        }

        let source = Arc::clone(&self.source);
        let warmup = self.config.warmup_frames;
        match tokio::task::spawn_blocking(move || capture::discard_frames(&source, warmup)).await {
            Ok(discarded) => debug!(discarded, "Warm-up frames discarded"),
            Err(e) => warn!("Warm-up capture thread failed: {}", e),
        }

        self.stream_fps.store(fps.max(1), Ordering::Relaxed);
        self.streaming.turn_on();
        info!(fps, "Live stream enabled");
        true
    }

    /// Turn the live view off
    pub fn stop_streaming(&self) {
        if !self.streaming.turn_off() {
            warn!("Live stream not running");
            return;
        }
        info!("Live stream disabled");
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_on()
    }

    /// Responder for a live view client, `None` while streaming is off
    pub fn live_stream(&self) -> Option<LiveStreamResponder> {
        if !self.streaming.is_on() {
            return None;
        }
        let fps = self.stream_fps.load(Ordering::Relaxed).max(1);
        let settings = LiveStreamSettings {
            boundary: self.config.stream_boundary.clone(),
            quality: self.config.stream_quality,
            frame_interval: (Duration::from_secs(1) / fps).max(MIN_FRAME_INTERVAL),
            ..LiveStreamSettings::default()
        };
        Some(LiveStreamResponder::new(
            Arc::clone(&self.source),
            Arc::clone(&self.encoder),
            self.streaming.clone(),
            settings,
        ))
    }

    /// Serve one live view client until streaming stops or it disconnects.
    ///
    /// The error value is the reply to send: 503 when streaming is off,
    /// 500 when a frame could not be converted.
    pub async fn stream_to(
        &self,
        sink: &mut dyn MultipartSink,
    ) -> std::result::Result<StreamSummary, HttpReply> {
        let Some(responder) = self.live_stream() else {
            return Err(HttpReply::camera_not_started());
        };
        responder.run(sink).await.map_err(|_| HttpReply::internal_error())
    }

    /// One JPEG frame for the snapshot endpoint
    pub async fn snapshot(&self) -> HttpReply {
        stream::snapshot(
            Arc::clone(&self.source),
            Arc::clone(&self.encoder),
            self.config.stream_quality,
        )
        .await
    }

    async fn capture_stable(&self) -> Result<FrameLease> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || capture::acquire_stable(&source, STABLE_CAPTURE_FRAMES))
            .await
            .map_err(|e| CameraError::capture_failed(format!("capture thread failed: {e}")))?
    }

    async fn join_previous_encoder(&self) {
        let mut slot = self.encoder_slot.lock().await;
        if let Some(previous) = slot.as_mut() {
            join_encoder(previous).await;
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("started", &self.is_started())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

async fn join_encoder(task: &mut EncoderTask) {
    if task.is_joined() {
        return;
    }
    match task.join().await {
        Ok(report) => debug!(chunks = report.chunks, bytes = report.bytes, "Previous encoder joined"),
        Err(e) => warn!("Previous encoder did not exit cleanly: {}", e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockFrameSource, RecordingConnector, RecordingSink, ScriptedEncoder};

    struct Rig {
        camera: Camera,
        source: Arc<MockFrameSource>,
        http: RecordingConnector,
        encoder_calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    fn rig(encoder: ScriptedEncoder) -> Rig {
        let source = Arc::new(MockFrameSource::rgb565(8, 8));
        let http = RecordingConnector::new();
        let encoder_calls = encoder.calls();
        let config = CameraConfig::default()
            .with_identity("aa:bb:cc:dd:ee:ff", "client-1")
            .with_channel_capacity(3);
        let camera = Camera::new(source.clone(), Arc::new(encoder), Arc::new(http.clone()), config);
        Rig { camera, source, http, encoder_calls }
    }

    fn parse(json: &str) -> serde_json::Value {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explain_without_url_spawns_nothing() {
        let rig = rig(ScriptedEncoder::new(4, 8));

        let response = rig.camera.explain("what is this?").await;

        assert_eq!(
            parse(&response.to_json()),
            serde_json::json!({"success": false, "message": "Image explain URL or token is not set"})
        );
        assert_eq!(rig.encoder_calls.load(Ordering::SeqCst), 0);
        assert_eq!(rig.http.created(), 0);
        assert_eq!(rig.source.acquired(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explain_returns_server_body_unchanged() {
        let _ = tracing_subscriber::fmt::try_init();
        let rig = rig(ScriptedEncoder::new(20, 16));
        rig.camera.set_explain_url("http://explain.local/api", "secret");
        rig.http.respond_with(200, r#"{"success": true, "result": "a cup"}"#);

        let response = rig.camera.explain("what is this?").await;

        assert_eq!(response, ExplainResponse::Answer(r#"{"success": true, "result": "a cup"}"#.to_string()));
        assert_eq!(response.to_json(), r#"{"success": true, "result": "a cup"}"#);

        let upload = rig.http.last();
        assert_eq!(upload.header("Authorization"), Some("Bearer secret"));
        assert_eq!(upload.header("Device-Id"), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(upload.header("Client-Id"), Some("client-1"));
        assert_eq!(upload.header("Transfer-Encoding"), Some("chunked"));
        assert_eq!(
            upload.header("Content-Type"),
            Some("multipart/form-data; boundary=----ESP32_CAMERA_BOUNDARY")
        );
        assert_eq!(rig.source.outstanding(), 0);
        // Stable capture grabs two frames
        assert_eq!(rig.source.acquired(), 2);
    }

    #[test]
    fn from_config_builds_default_stack() {
        let source = Arc::new(MockFrameSource::rgb565(8, 8));
        let config = CameraConfig::default().with_chunk_size(64);

        let camera = Camera::from_config(source, config).unwrap();

        assert_eq!(camera.config().chunk_size, 64);
        assert!(!camera.is_started());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_token_sends_no_authorization() {
        let rig = rig(ScriptedEncoder::new(2, 4));
        rig.camera.set_explain_url("http://explain.local/api", "");

        assert!(rig.camera.explain("q").await.is_success());
        assert_eq!(rig.http.last().header("Authorization"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_open_then_second_explain_completes() {
        let rig = rig(ScriptedEncoder::new(100, 32));
        rig.camera.set_explain_url("http://explain.local/api", "t");
        rig.http.fail_open();

        let first = tokio::time::timeout(Duration::from_secs(10), rig.camera.explain("one"))
            .await
            .expect("first explain hung");
        assert_eq!(first, ExplainResponse::Failure("Failed to connect to explain URL".to_string()));

        let second = tokio::time::timeout(Duration::from_secs(10), rig.camera.explain("two"))
            .await
            .expect("second explain deadlocked");
        assert!(!second.is_success());
        assert_eq!(rig.source.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejected_upload_reports_upload_failure() {
        let rig = rig(ScriptedEncoder::new(3, 8));
        rig.camera.set_explain_url("http://explain.local/api", "t");
        rig.http.respond_with(500, "boom");

        let response = rig.camera.explain("q").await;

        assert_eq!(response, ExplainResponse::Failure("Failed to upload photo".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explain_uses_held_capture() {
        let rig = rig(ScriptedEncoder::new(2, 4));
        rig.camera.set_explain_url("http://explain.local/api", "t");

        rig.camera.capture().await.unwrap();
        assert_eq!(rig.source.outstanding(), 1);

        assert!(rig.camera.explain("q").await.is_success());
        assert_eq!(rig.source.acquired(), 2);
        assert_eq!(rig.source.outstanding(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_explains_never_overlap_encoders() {
        let encoder = ScriptedEncoder::new(10, 8).with_chunk_delay(Duration::from_millis(1));
        let max_concurrent = encoder.max_concurrent();
        let rig = Arc::new(rig(encoder));
        rig.camera.set_explain_url("http://explain.local/api", "t");

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let rig = Arc::clone(&rig);
                tokio::spawn(async move { rig.camera.explain(&format!("q{i}")).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_success());
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(rig.encoder_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_requires_started_camera() {
        let rig = rig(ScriptedEncoder::new(1, 4));

        assert!(!rig.camera.start_streaming(8).await);
        assert!(!rig.camera.is_streaming());

        rig.camera.start().unwrap();
        assert!(rig.camera.start_streaming(8).await);
        assert!(rig.camera.start_streaming(8).await);
        assert_eq!(rig.source.acquired(), 5);
        assert_eq!(rig.source.outstanding(), 0);

        rig.camera.stop_streaming();
        assert!(!rig.camera.is_streaming());
        rig.camera.stop_streaming();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_request_while_off_is_unavailable() {
        let rig = rig(ScriptedEncoder::new(1, 4));
        let mut sink = RecordingSink::stop_after(1, StreamSwitch::default());

        let reply = rig.camera.stream_to(&mut sink).await.unwrap_err();

        assert_eq!(reply, HttpReply::text(503, "Camera not started"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_ends_live_stream() {
        let rig = Arc::new(rig(ScriptedEncoder::new(1, 4)));
        rig.camera.start().unwrap();
        assert!(rig.camera.start_streaming(50).await);

        let streaming = Arc::clone(&rig);
        let client = tokio::spawn(async move {
            let (mut tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(4);
            let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
            let summary = streaming.camera.stream_to(&mut tx).await;
            drop(tx);
            let _ = drain.await;
            summary
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.camera.stop();

        let summary = client.await.unwrap().unwrap();
        assert!(summary.frames > 0);
        assert!(!rig.source.is_running());
        assert_eq!(rig.source.outstanding(), 0);
    }
}
