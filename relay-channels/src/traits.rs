//! Channel traits for plugging the relay into a messaging host.

use crate::message::{ChannelMessage, OutgoingMessage};
use async_trait::async_trait;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay error: {0}")]
    Relay(#[from] relay_common::RelayError),
}

/// A messaging host the relay can sit on.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Initialize the channel (connect, authenticate, etc.).
    async fn init(&mut self) -> ChannelResult<()>;

    /// Deliver a composed reply. Returns a host message id.
    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String>;

    /// Read incoming messages until the host closes, calling `callback` for each.
    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(ChannelMessage) + Send + Sync + 'static;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> ChannelResult<()>;

    /// Shutdown the channel gracefully.
    async fn shutdown(&self) -> ChannelResult<()>;
}

/// Turns an incoming message into an optional reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `Ok(None)` means the message is not for the bot.
    async fn handle(&self, message: ChannelMessage) -> ChannelResult<Option<OutgoingMessage>>;
}
