//! Control session seam

use async_trait::async_trait;
use std::sync::Arc;

use crate::Result;

/// Hook receiving one incoming text message
pub type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Hook fired on connect or disconnect
pub type EventHook = Arc<dyn Fn() + Send + Sync>;

/// One control channel connection attempt.
///
/// A session is connected at most once. Reconnecting means creating a new
/// session through its [`SessionFactory`].
#[async_trait]
pub trait ControlSession: Send + Sync + 'static {
    /// Open the channel and complete the handshake
    async fn connect(&self) -> Result<()>;

    /// Send one text message
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Resolves once the channel is closed, by either side
    async fn closed(&self);

    /// Close the channel; no-op when already closed
    async fn close(&self);
}

/// Creates fresh sessions for each connect attempt
pub trait SessionFactory: Send + Sync + 'static {
    /// Build an unconnected session delivering incoming text to `on_message`
    fn create(&self, on_message: MessageHook) -> Arc<dyn ControlSession>;
}
