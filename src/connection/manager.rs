//! Connection lifecycle manager

use futures::Stream;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::heartbeat::{HeartbeatStatus, HeartbeatTask};
use super::websocket::WebSocketFactory;
use super::{ConnectionState, ControlSession, EventHook, MessageHook, SessionFactory};
use crate::config::ConnectionConfig;
use crate::{CameraError, Result};

/// Registered callbacks.
///
/// Kept apart from the manager state so sessions can hold the message hook
/// without keeping the manager alive.
#[derive(Default)]
struct Hooks {
    on_connected: Option<EventHook>,
    on_disconnected: Option<EventHook>,
    on_message: Option<MessageHook>,
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    factory: Arc<dyn SessionFactory>,
    /// Current session; locked only to swap or clone the pointer
    session: Mutex<Option<Arc<dyn ControlSession>>>,
    state: watch::Sender<ConnectionState>,
    hooks: Arc<RwLock<Hooks>>,
    attempts: AtomicU32,
    last_connected_ms: AtomicU64,
    heartbeat: Arc<HeartbeatStatus>,
}

/// Keeps a control session connected.
///
/// Callbacks fire on the supervising task: `on_connected` right after the
/// handshake, `on_disconnected` when an established session closes on its
/// own. `on_message` fires on the session's reader task. None of them fire
/// for an explicit [`stop`](ConnectionManager::stop).
///
/// ```rust,no_run
/// use camlink::config::ConnectionConfig;
/// use camlink::connection::ConnectionManager;
///
/// # #[tokio::main]
/// # async fn main() -> camlink::Result<()> {
/// let manager = ConnectionManager::websocket(ConnectionConfig::new("wss://example.com/camera"));
/// manager.on_message(|text| println!("server: {text}"));
/// manager.start()?;
/// // ...
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    /// Create an idle manager using `factory` for sessions
    pub fn new(config: ConnectionConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let inner = Inner {
            config,
            factory,
            session: Mutex::new(None),
            state,
            hooks: Arc::new(RwLock::new(Hooks::default())),
            attempts: AtomicU32::new(0),
            last_connected_ms: AtomicU64::new(0),
            heartbeat: Arc::new(HeartbeatStatus::default()),
        };
        Self { inner: Arc::new(inner), supervisor: Mutex::new(None) }
    }

    /// Create an idle manager speaking websocket
    pub fn websocket(config: ConnectionConfig) -> Self {
        let factory = Arc::new(WebSocketFactory::new(config.clone()));
        Self::new(config, factory)
    }

    /// Start the connect loop.
    ///
    /// Fails without leaving `Idle` when no server address is configured.
    /// Calling it while the loop is running does nothing. Must be called
    /// within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.inner.config.server_url.is_empty() {
            error!("No server URL configured for control channel");
            return Err(CameraError::config("control channel server URL is not set"));
        }

        let mut supervisor = lock(&self.supervisor);
        if supervisor.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            debug!("Connection loop already running");
            return Ok(());
        }

        info!("Starting control channel manager");
        self.inner.attempts.store(0, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), cancel.clone()));
        *supervisor = Some(Supervisor { cancel, handle });
        Ok(())
    }

    /// Stop everything and close the session.
    ///
    /// Joins the connect loop and the heartbeat before returning. Safe to
    /// call repeatedly and from any state; always ends in `Closed`.
    pub async fn stop(&self) {
        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            info!("Stopping control channel manager");
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.handle.await {
                warn!("Connection loop did not exit cleanly: {}", e);
            }
        }

        let session = self.inner.replace_session(None);
        if let Some(session) = session {
            session.close().await;
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Whether the session is established and open
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Send a text message over the control channel.
    ///
    /// Fails with `RetriesExhausted` once the connect loop has given up,
    /// and with `NotConnected` in any other state but `Established`.
    pub async fn send_control_message(&self, text: &str) -> Result<()> {
        if !self.is_connected() {
            warn!("Cannot send control message: not connected");
            let attempts = self.reconnect_attempts();
            if self.state() == ConnectionState::Closed
                && attempts >= self.inner.config.max_reconnect_attempts.max(1)
            {
                return Err(CameraError::RetriesExhausted { attempts });
            }
            return Err(CameraError::NotConnected);
        }
        let Some(session) = self.inner.current_session() else {
            return Err(CameraError::NotConnected);
        };
        session.send_text(text).await
    }

    /// Register the connected callback
    pub fn on_connected(&self, hook: impl Fn() + Send + Sync + 'static) {
        write_hooks(&self.inner.hooks).on_connected = Some(Arc::new(hook));
    }

    /// Register the disconnected callback
    pub fn on_disconnected(&self, hook: impl Fn() + Send + Sync + 'static) {
        write_hooks(&self.inner.hooks).on_disconnected = Some(Arc::new(hook));
    }

    /// Register the incoming message callback
    pub fn on_message(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        write_hooks(&self.inner.hooks).on_message = Some(Arc::new(hook));
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch receiver for the lifecycle state
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Current state followed by every change
    pub fn state_changes(&self) -> impl Stream<Item = ConnectionState> + 'static {
        WatchStream::new(self.inner.state.subscribe())
    }

    /// Consecutive failed connects since the last success
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Time of the last successful handshake
    pub fn last_connected_at(&self) -> Option<SystemTime> {
        match self.inner.last_connected_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Time of the last delivered heartbeat
    pub fn last_heartbeat_at(&self) -> Option<SystemTime> {
        self.inner.heartbeat.last_sent_at()
    }

    /// Heartbeat bookkeeping
    pub fn heartbeat(&self) -> &HeartbeatStatus {
        &self.inner.heartbeat
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(supervisor) = lock(&self.supervisor).as_ref() {
            supervisor.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("server_url", &self.inner.config.server_url)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Control channel state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    fn current_session(&self) -> Option<Arc<dyn ControlSession>> {
        lock(&self.session).clone()
    }

    fn replace_session(
        &self,
        session: Option<Arc<dyn ControlSession>>,
    ) -> Option<Arc<dyn ControlSession>> {
        std::mem::replace(&mut *lock(&self.session), session)
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Established
            && self.current_session().is_some_and(|s| s.is_open())
    }

    fn message_hook(&self) -> MessageHook {
        let hooks = Arc::clone(&self.hooks);
        Arc::new(move |text: &str| {
            let hook = read_hooks(&hooks).on_message.clone();
            if let Some(hook) = hook {
                hook(text);
            }
        })
    }

    fn fire_connected(&self) {
        let hook = read_hooks(&self.hooks).on_connected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn fire_disconnected(&self) {
        let hook = read_hooks(&self.hooks).on_disconnected.clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Connect loop: connect, hold the session while it is open, retry on failure
async fn supervise(inner: Arc<Inner>, cancel: CancellationToken) {
    let interval = inner.config.reconnect_interval();
    let max_attempts = inner.config.max_reconnect_attempts.max(1);
    info!(url = %inner.config.server_url, "Connection loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        inner.set_state(ConnectionState::Connecting);
        let session = inner.factory.create(inner.message_hook());
        inner.replace_session(Some(Arc::clone(&session)));

        info!("Attempting to connect to control server");
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = session.connect() => result,
        };

        match connected {
            Ok(()) => {
                inner.attempts.store(0, Ordering::Relaxed);
                inner.last_connected_ms.store(now_millis(), Ordering::Relaxed);
                inner.set_state(ConnectionState::Established);
                info!("Control channel established");
                inner.fire_connected();

                let heartbeat = HeartbeatTask::spawn(
                    Arc::clone(&session),
                    inner.config.device_id.clone(),
                    inner.config.heartbeat_interval(),
                    Arc::clone(&inner.heartbeat),
                    cancel.child_token(),
                );

                let lost = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = session.closed() => true,
                };

                if !lost {
                    heartbeat.stop().await;
                    break;
                }

                warn!("Control channel closed, reconnecting");
                inner.fire_disconnected();
                heartbeat.stop().await;
            }
            Err(e) => {
                session.close().await;
                let attempts = inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                if attempts >= max_attempts {
                    error!(
                        attempts,
                        "Max reconnection attempts reached, stopping control channel: {}", e
                    );
                    inner.replace_session(None);
                    inner.set_state(ConnectionState::Closed);
                    break;
                }

                warn!(
                    "Connection failed, retrying in {:?} (attempt {}/{}): {}",
                    interval, attempts, max_attempts, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    info!("Connection loop ended");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_hooks(hooks: &RwLock<Hooks>) -> std::sync::RwLockReadGuard<'_, Hooks> {
    hooks.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_hooks(hooks: &RwLock<Hooks>) -> std::sync::RwLockWriteGuard<'_, Hooks> {
    hooks.write().unwrap_or_else(PoisonError::into_inner)
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
