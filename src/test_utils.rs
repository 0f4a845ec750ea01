//! Mock collaborators for tests and benches
//!
//! Scripted stand-ins for the sensor, the JPEG encoder, the HTTP client,
//! the live view client and the control channel. Each one records what
//! happened to it so tests can assert on leaks, ordering and wire output.

#![cfg(any(test, feature = "test-utils"))]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::capture::FrameSource;
use crate::connection::{ConnectionState, ControlSession, MessageHook, SessionFactory};
use crate::encoder::{ChunkSink, JpegEncoder};
use crate::stream::{MultipartSink, StreamSwitch};
use crate::types::{Frame, PixelFormat};
use crate::upload::{HttpConnector, UploadRequest};
use crate::{CameraError, Result};

/// Decrement a counter if it is positive; true when it was
fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

/// Frame source handing out copies of one template frame
#[derive(Debug)]
pub struct MockFrameSource {
    template: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
    failures: AtomicUsize,
    running: AtomicBool,
    fail_start: AtomicBool,
}

impl MockFrameSource {
    pub fn new(template: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            template: template.into(),
            width,
            height,
            format,
            sequence: AtomicU64::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Raw RGB565 frames with a gradient pattern
    pub fn rgb565(width: u32, height: u32) -> Self {
        let len = (width * height * 2) as usize;
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        Self::new(data, width, height, PixelFormat::Rgb565)
    }

    /// Frames the sensor already compressed
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self::new(data, 160, 120, PixelFormat::Jpeg)
    }

    /// Make the next `count` acquisitions fail with a capture error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make `start` fail
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Frames handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.acquired() - self.released()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl FrameSource for MockFrameSource {
    fn acquire_frame(&self) -> Result<Frame> {
        if take_one(&self.failures) {
            return Err(CameraError::capture_failed("sensor returned no frame"));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(self.template.clone(), self.width, self.height, self.format, sequence))
    }

    fn release_frame(&self, _frame: Frame) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CameraError::capture_failed("sensor init failed"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Encoder emitting a fixed number of deterministic chunks
#[derive(Debug, Clone)]
pub struct ScriptedEncoder {
    chunk_count: usize,
    chunk_len: usize,
    fail_after: Option<usize>,
    chunk_delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl ScriptedEncoder {
    pub fn new(chunk_count: usize, chunk_len: usize) -> Self {
        Self {
            chunk_count,
            chunk_len,
            fail_after: None,
            chunk_delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail with an encode error after `chunks` chunks
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Sleep between chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Encode calls so far
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Highest number of encode calls seen running at once
    pub fn max_concurrent(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_active)
    }

    /// Bytes a complete encode produces
    pub fn expected_output(&self) -> Vec<u8> {
        (0..self.chunk_count).flat_map(|i| self.chunk(i)).collect()
    }

    fn chunk(&self, index: usize) -> Vec<u8> {
        (0..self.chunk_len).map(|j| ((index * 31 + j) % 256) as u8).collect()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JpegEncoder for ScriptedEncoder {
    fn encode(&self, _frame: &Frame, _quality: u8, sink: &mut ChunkSink<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        for index in 0..self.chunk_count {
            if self.fail_after == Some(index) {
                return Err(CameraError::encode_failed("scripted encoder failure"));
            }
            sink(&self.chunk(index))?;
            if let Some(delay) = self.chunk_delay {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }
}

/// Everything one recorded upload request saw
#[derive(Debug, Clone, Default)]
pub struct RecordedUpload {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Non-empty writes, concatenated
    pub body: Vec<u8>,
    /// Write calls, including the terminal one
    pub writes: usize,
    /// Whether the zero-length terminal write happened
    pub terminated: bool,
    pub closed: bool,
}

impl RecordedUpload {
    /// First header value named `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct ConnectorScript {
    status: u16,
    body: String,
    fail_open: bool,
    fail_write_at: Option<usize>,
    uploads: Vec<Arc<Mutex<RecordedUpload>>>,
}

/// Connector whose requests record their traffic and answer from a script
#[derive(Debug, Clone)]
pub struct RecordingConnector {
    script: Arc<Mutex<ConnectorScript>>,
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConnector {
    /// Answers 200 with `{}` unless told otherwise
    pub fn new() -> Self {
        let script = ConnectorScript {
            status: 200,
            body: "{}".to_string(),
            fail_open: false,
            fail_write_at: None,
            uploads: Vec::new(),
        };
        Self { script: Arc::new(Mutex::new(script)) }
    }

    pub fn respond_with(&self, status: u16, body: &str) {
        let mut script = self.script.lock().unwrap();
        script.status = status;
        script.body = body.to_string();
    }

    pub fn fail_open(&self) {
        self.script.lock().unwrap().fail_open = true;
    }

    /// Fail the `n`-th write call (1-based) of each request
    pub fn fail_write_at(&self, n: usize) {
        self.script.lock().unwrap().fail_write_at = Some(n);
    }

    /// Requests created so far
    pub fn created(&self) -> usize {
        self.script.lock().unwrap().uploads.len()
    }

    /// Snapshot of the most recent request
    pub fn last(&self) -> RecordedUpload {
        let script = self.script.lock().unwrap();
        script.uploads.last().map(|u| u.lock().unwrap().clone()).unwrap_or_default()
    }
}

impl HttpConnector for RecordingConnector {
    fn create(&self) -> Box<dyn UploadRequest> {
        let record = Arc::new(Mutex::new(RecordedUpload::default()));
        self.script.lock().unwrap().uploads.push(Arc::clone(&record));
        Box::new(RecordingRequest { script: Arc::clone(&self.script), record })
    }
}

struct RecordingRequest {
    script: Arc<Mutex<ConnectorScript>>,
    record: Arc<Mutex<RecordedUpload>>,
}

#[async_trait]
impl UploadRequest for RecordingRequest {
    fn set_header(&mut self, name: &str, value: &str) {
        self.record.lock().unwrap().headers.push((name.to_string(), value.to_string()));
    }

    async fn open(&mut self, method: &str, url: &str) -> Result<()> {
        if self.script.lock().unwrap().fail_open {
            return Err(CameraError::connection_failed("scripted open failure"));
        }
        let mut record = self.record.lock().unwrap();
        record.method = Some(method.to_string());
        record.url = Some(url.to_string());
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let fail_at = self.script.lock().unwrap().fail_write_at;
        let mut record = self.record.lock().unwrap();
        record.writes += 1;
        if fail_at == Some(record.writes) {
            return Err(CameraError::io("scripted write failure"));
        }
        if data.is_empty() {
            record.terminated = true;
        } else {
            record.body.extend_from_slice(data);
        }
        Ok(())
    }

    async fn status_code(&mut self) -> Result<u16> {
        Ok(self.script.lock().unwrap().status)
    }

    async fn read_all(&mut self) -> Result<String> {
        Ok(self.script.lock().unwrap().body.clone())
    }

    async fn close(&mut self) {
        self.record.lock().unwrap().closed = true;
    }
}

/// Live view client collecting everything written to it
#[derive(Debug)]
pub struct RecordingSink {
    bytes: Vec<u8>,
    writes: usize,
    stop_after_parts: usize,
    switch: StreamSwitch,
}

impl RecordingSink {
    /// Turn `switch` off once `parts` complete parts were written
    pub fn stop_after(parts: usize, switch: StreamSwitch) -> Self {
        Self { bytes: Vec::new(), writes: 0, stop_after_parts: parts, switch }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

#[async_trait]
impl MultipartSink for RecordingSink {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.bytes.extend_from_slice(&bytes);
        self.writes += 1;
        // Header, payload and trailing CRLF make one part
        if self.writes == self.stop_after_parts * 3 {
            self.switch.turn_off();
        }
        Ok(())
    }
}

/// Control session driven by the test
pub struct MockSession {
    connect_ok: bool,
    open: AtomicBool,
    closed: CancellationToken,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<String>>,
    states_at_send: Mutex<Vec<ConnectionState>>,
    state_probe: Option<watch::Receiver<ConnectionState>>,
    connects: Arc<AtomicUsize>,
    on_message: Option<MessageHook>,
}

impl MockSession {
    fn scripted(
        connect_ok: bool,
        connects: Arc<AtomicUsize>,
        state_probe: Option<watch::Receiver<ConnectionState>>,
        on_message: Option<MessageHook>,
    ) -> Self {
        Self {
            connect_ok,
            open: AtomicBool::new(false),
            closed: CancellationToken::new(),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            states_at_send: Mutex::new(Vec::new()),
            state_probe,
            connects,
            on_message,
        }
    }

    /// Session that is already open
    pub fn connected() -> Self {
        let session = Self::scripted(true, Arc::new(AtomicUsize::new(0)), None, None);
        session.open.store(true, Ordering::SeqCst);
        session
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }

    /// Deliver an incoming text message
    pub fn deliver(&self, text: &str) {
        if let Some(hook) = &self.on_message {
            hook(text);
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Manager state observed at each successful send
    pub fn states_at_send(&self) -> Vec<ConnectionState> {
        self.states_at_send.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl ControlSession for MockSession {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_ok {
            self.closed.cancel();
            return Err(CameraError::connection_failed("scripted connect failure"));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CameraError::io("scripted send failure"));
        }
        if let Some(probe) = &self.state_probe {
            self.states_at_send.lock().unwrap().push(*probe.borrow());
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Factory producing [`MockSession`]s from a connect script
pub struct MockSessionFactory {
    script: Mutex<VecDeque<bool>>,
    default_ok: bool,
    connects: Arc<AtomicUsize>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    state_probe: Mutex<Option<watch::Receiver<ConnectionState>>>,
}

impl MockSessionFactory {
    fn with_default(default_ok: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_ok,
            connects: Arc::new(AtomicUsize::new(0)),
            sessions: Mutex::new(Vec::new()),
            state_probe: Mutex::new(None),
        }
    }

    /// Every connect fails
    pub fn failing() -> Self {
        Self::with_default(false)
    }

    /// Every connect succeeds
    pub fn succeeding() -> Self {
        Self::with_default(true)
    }

    /// Use `outcomes` for the first connects, then succeed
    pub fn scripted(outcomes: impl IntoIterator<Item = bool>) -> Self {
        let factory = Self::with_default(true);
        factory.script.lock().unwrap().extend(outcomes);
        factory
    }

    /// Record the manager state on every send of future sessions
    pub fn observe_state(&self, probe: watch::Receiver<ConnectionState>) {
        *self.state_probe.lock().unwrap() = Some(probe);
    }

    /// Connect calls across all sessions
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, on_message: MessageHook) -> Arc<dyn ControlSession> {
        let connect_ok = self.script.lock().unwrap().pop_front().unwrap_or(self.default_ok);
        let probe = self.state_probe.lock().unwrap().clone();
        let session = Arc::new(MockSession::scripted(
            connect_ok,
            Arc::clone(&self.connects),
            probe,
            Some(on_message),
        ));
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        session
    }
}
