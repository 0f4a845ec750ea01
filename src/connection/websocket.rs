//! Websocket control session
//!
//! Connects with the bearer token and device identity in the upgrade
//! request headers, sends a client hello and waits for the server hello
//! before reporting the session as connected. After that a reader task
//! forwards text frames to the message hook and answers pings. The
//! session counts as closed once the reader sees a close frame, a read
//! error or the end of the stream.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlSession, MessageHook, SessionFactory};
use crate::config::ConnectionConfig;
use crate::{CameraError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = Arc<tokio::sync::Mutex<Option<SplitSink<WsStream, Message>>>>;

/// Client hello sent right after the upgrade
#[derive(Debug, Serialize)]
struct ClientHello<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    version: u32,
    transport: &'a str,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    transport: Option<String>,
}

/// Creates [`WebSocketSession`]s for one server
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    config: Arc<ConnectionConfig>,
}

impl WebSocketFactory {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config: Arc::new(config) }
    }
}

impl SessionFactory for WebSocketFactory {
    fn create(&self, on_message: MessageHook) -> Arc<dyn ControlSession> {
        Arc::new(WebSocketSession::new(Arc::clone(&self.config), on_message))
    }
}

/// One websocket connection to the control server
pub struct WebSocketSession {
    config: Arc<ConnectionConfig>,
    on_message: MessageHook,
    writer: WsWriter,
    open: Arc<AtomicBool>,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketSession {
    pub fn new(config: Arc<ConnectionConfig>, on_message: MessageHook) -> Self {
        Self {
            config,
            on_message,
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            open: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
            reader: Mutex::new(None),
        }
    }

    fn upgrade_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let config = &self.config;
        let mut request = config.server_url.as_str().into_client_request().map_err(|e| {
            CameraError::connection_failed_with_source(
                format!("invalid server URL {}", config.server_url),
                e,
            )
        })?;

        let headers = request.headers_mut();
        if !config.token.is_empty() {
            headers.insert("Authorization", header_value(&format!("Bearer {}", config.token))?);
        }
        headers.insert("Protocol-Version", header_value(&config.protocol_version.to_string())?);
        headers.insert("Device-Id", header_value(&config.device_id)?);
        headers.insert("Client-Id", header_value(&config.client_id)?);
        Ok(request)
    }

    async fn handshake(&self) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>)> {
        let request = self.upgrade_request()?;
        debug!(url = %self.config.server_url, "Opening websocket");

        let (stream, _) = connect_async(request).await.map_err(|e| {
            CameraError::connection_failed_with_source("websocket connect failed", e)
        })?;
        let (mut write, mut read) = stream.split();

        let hello = serde_json::to_string(&ClientHello {
            kind: "hello",
            version: self.config.protocol_version,
            transport: "websocket",
        })?;
        write.send(Message::Text(hello)).await.map_err(|e| {
            CameraError::connection_failed_with_source("sending hello failed", e)
        })?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Ok(incoming) = serde_json::from_str::<IncomingMessage>(&text) else {
                        debug!("Ignoring non-JSON message before server hello");
                        continue;
                    };
                    if incoming.kind.as_deref() != Some("hello") {
                        continue;
                    }
                    match incoming.transport.as_deref() {
                        Some(transport) if transport != "websocket" => {
                            return Err(CameraError::connection_failed(format!(
                                "unsupported transport {transport}"
                            )));
                        }
                        _ => {}
                    }
                    return Ok((write, read));
                }
                Ok(Message::Ping(data)) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(CameraError::connection_failed_with_source(
                        "websocket read failed during handshake",
                        e,
                    ));
                }
            }
        }
        Err(CameraError::connection_failed("websocket closed before server hello"))
    }
}

#[async_trait]
impl ControlSession for WebSocketSession {
    async fn connect(&self) -> Result<()> {
        if self.closed.is_cancelled() || self.open.load(Ordering::Acquire) {
            return Err(CameraError::connection_failed("session already used"));
        }

        let timeout = self.config.handshake_timeout();
        let (write, read) = match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.closed.cancel();
                return Err(e);
            }
            Err(_) => {
                self.closed.cancel();
                return Err(CameraError::Timeout { duration: timeout });
            }
        };

        *self.writer.lock().await = Some(write);
        self.open.store(true, Ordering::Release);
        info!(url = %self.config.server_url, "Websocket session established");

        let reader = tokio::spawn(read_loop(
            read,
            Arc::clone(&self.writer),
            Arc::clone(&self.on_message),
            Arc::clone(&self.open),
            self.closed.clone(),
        ));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(reader);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(CameraError::NotConnected);
        };
        sink.send(Message::Text(text.to_string()))
            .await
            .map_err(|e| CameraError::io_with_source("websocket send", e))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.closed.cancel();

        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Websocket reader did not exit cleanly: {}", e);
            }
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    writer: WsWriter,
    on_message: MessageHook,
    open: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = read.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => on_message(&text),
            Some(Ok(Message::Ping(data))) => {
                let mut writer = writer.lock().await;
                if let Some(sink) = writer.as_mut() {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        warn!("Failed to send pong");
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("Websocket closed by server");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Websocket error: {}", e);
                break;
            }
            None => break,
        }
    }
    open.store(false, Ordering::Release);
    closed.cancel();
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| CameraError::config(format!("invalid header value {value:?}: {e}")))
}
