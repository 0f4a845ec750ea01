//! Heartbeat task nested inside an established session

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ControlSession;
use crate::Result;

/// Liveness message sent over the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub device_id: String,
    /// Unix time in milliseconds
    pub timestamp: u64,
}

impl HeartbeatMessage {
    pub fn new(device_id: impl Into<String>, timestamp: u64) -> Self {
        Self { kind: "heartbeat", device_id: device_id.into(), timestamp }
    }

    /// Heartbeat stamped with the current wall clock
    pub fn now(device_id: impl Into<String>) -> Self {
        Self::new(device_id, unix_millis(SystemTime::now()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Heartbeat bookkeeping shared between the task and the manager
#[derive(Debug, Default)]
pub struct HeartbeatStatus {
    active: AtomicBool,
    sent: AtomicU64,
    last_sent_ms: AtomicU64,
}

impl HeartbeatStatus {
    /// Whether a heartbeat task is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Heartbeats delivered over the manager's lifetime
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Time of the last delivered heartbeat
    pub fn last_sent_at(&self) -> Option<SystemTime> {
        match self.last_sent_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    fn record_sent(&self, timestamp: u64) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.last_sent_ms.store(timestamp.max(1), Ordering::Relaxed);
    }
}

/// Running heartbeat task; must be stopped before its session is torn down
pub(crate) struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    pub(crate) fn spawn(
        session: Arc<dyn ControlSession>,
        device_id: String,
        interval: Duration,
        status: Arc<HeartbeatStatus>,
        cancel: CancellationToken,
    ) -> Self {
        status.active.store(true, Ordering::Release);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run(session, device_id, interval, &status, task_cancel).await;
            status.active.store(false, Ordering::Release);
        });
        Self { cancel, handle }
    }

    /// Cancel and join
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Heartbeat task did not exit cleanly: {}", e);
        }
    }
}

async fn run(
    session: Arc<dyn ControlSession>,
    device_id: String,
    interval: Duration,
    status: &HeartbeatStatus,
    cancel: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, "Heartbeat task started");
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !session.is_open() {
            debug!("Session no longer open, heartbeat exiting");
            break;
        }

        let message = HeartbeatMessage::now(device_id.as_str());
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to build heartbeat: {}", e);
                break;
            }
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = session.send_text(&text) => sent,
        };
        match sent {
            Ok(()) => {
                status.record_sent(message.timestamp);
                debug!(timestamp = message.timestamp, "Heartbeat sent");
            }
            Err(e) => {
                // Closure of the session drives the reconnect, not this task
                warn!("Failed to send heartbeat: {}", e);
                break;
            }
        }
    }

    info!("Heartbeat task ended");
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
