//! Relay Channels - answers chat messages through a Dify app.
//!
//! ## Architecture
//!
//! A host channel delivers messages; the handler decides whether to answer,
//! the bot runs the turn against Dify and the reply is rendered back into a
//! composite message for the host.
//!
//! ```text
//! Channel → BotHandler → DifyBot ──▶ SessionStore
//!                           │
//!                           ├──▶ DifyClient ─ chat-messages (blocking) ─▶ compose
//!                           │               ─ chat-messages (streaming) ─▶ sse
//!                           │               ─ workflows/run
//!                           ▼
//! Channel ◀── compose_outgoing ◀── Reply
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod bot;
pub mod cli;
pub mod client;
pub mod compose;
pub mod handler;
pub mod inbound;
pub mod media;
pub mod message;
pub mod outbound;
pub mod session;
pub mod sse;
pub mod traits;

// Re-export commonly used types
pub use bot::DifyBot;
pub use cli::CliChannel;
pub use client::{ChatBackend, DifyClient};
pub use handler::BotHandler;
pub use media::{ImageCache, MediaDownloader};
pub use message::{ChannelMessage, Fragment, FragmentKind, OutgoingMessage, OutgoingSegment, Reply};
pub use session::{Session, SessionStore};
pub use sse::{StreamEvent, StreamReducer, StreamReply};
pub use traits::{Channel, ChannelError, ChannelResult, MessageHandler};

use relay_common::config::Config;
use std::sync::Arc;
use std::time::Duration;

/// How often expired sessions are physically removed.
pub const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically drop expired sessions and the images still pending for them.
/// Expiry is also checked on access, this only bounds memory and disk held by
/// idle users.
pub fn spawn_session_purge(bot: Arc<DifyBot>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = bot.purge_expired().await;
            if purged > 0 {
                tracing::debug!(purged, remaining = bot.sessions().len(), "Purged expired sessions");
            }
        }
    })
}

async fn answer<C, H>(channel: Arc<C>, handler: Arc<H>, message: ChannelMessage)
where
    C: Channel,
    H: MessageHandler,
{
    let message_id = message.id.clone();
    match handler.handle(message).await {
        Ok(Some(outgoing)) if !outgoing.is_empty() => {
            if let Err(e) = channel.send(outgoing).await {
                tracing::error!(message_id = %message_id, error = %e, "Failed to send reply");
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(message_id = %message_id, error = %e, "Failed to handle message");
        }
    }
}

/// Feed a channel's messages through a handler and send the replies back.
///
/// Each message is answered in its own task, so a slow turn only holds up
/// later turns of the same session. Returns once the channel stops listening
/// and every in-flight message has been answered.
pub async fn run_channel<C, H>(channel: Arc<C>, handler: Arc<H>) -> anyhow::Result<()>
where
    C: Channel + 'static,
    H: MessageHandler + 'static,
{
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChannelMessage>();

    let sender = channel.clone();
    let processor = tokio::spawn(async move {
        let mut inflight = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    inflight.spawn(answer(sender.clone(), handler.clone(), message));
                }
                Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!(error = %e, "Message task failed");
                    }
                }
            }
        }
        while let Some(done) = inflight.join_next().await {
            if let Err(e) = done {
                tracing::error!(error = %e, "Message task failed");
            }
        }
    });

    tracing::info!(channel = channel.name(), "Listening for messages");
    channel
        .listen(move |message| {
            if tx.send(message).is_err() {
                tracing::warn!("Message processor stopped, dropping message");
            }
        })
        .await?;

    processor.await?;
    channel.shutdown().await?;
    Ok(())
}

/// Build the relay from configuration and serve the CLI channel.
pub async fn start(config: &Config) -> anyhow::Result<()> {
    let sessions = Arc::new(SessionStore::from_config(&config.dify));
    let images = Arc::new(ImageCache::new());
    let client: Arc<dyn ChatBackend> = Arc::new(DifyClient::from_config(&config.dify));
    let bot = Arc::new(DifyBot::new(&config.dify, sessions, images, client));
    let handler = Arc::new(BotHandler::new(&config.dify, bot.clone()));

    let purge_handle = spawn_session_purge(bot, SESSION_PURGE_INTERVAL);

    let mut channel = CliChannel::new();
    channel.init().await?;
    let result = run_channel(Arc::new(channel), handler).await;

    purge_handle.abort();
    result
}
