//! CLI channel for talking to the bot from a terminal.
//!
//! Every line is a private message from the local user. `/quit` and `/exit`
//! stop the channel; any other line, including `/`-prefixed ones, goes
//! through the normal trigger rules.

use crate::message::{now_millis, ChannelMessage, OutgoingMessage};
use crate::traits::{Channel, ChannelResult};
use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

/// stdin/stdout channel.
pub struct CliChannel {
    user_id: String,
}

impl CliChannel {
    pub fn new() -> Self {
        Self {
            user_id: crate::inbound::DEFAULT_USER.to_string(),
        }
    }

    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Wrap one input line as an inbound message.
    pub fn message_from_line(&self, line: &str) -> ChannelMessage {
        ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            adapter: Some(self.name().to_string()),
            user_id: Some(self.user_id.clone()),
            text: line.to_string(),
            is_private: true,
            is_to_me: true,
            images: Vec::new(),
            timestamp: now_millis(),
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn init(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String> {
        let mut stdout = io::stdout();
        stdout
            .write_all(format!("{}\n", message.plain_text()).as_bytes())
            .await?;
        stdout.flush().await?;
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn listen<F>(&self, callback: F) -> ChannelResult<()>
    where
        F: Fn(ChannelMessage) + Send + Sync + 'static,
    {
        let mut lines = BufReader::new(io::stdin()).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "/quit" || line == "/exit" {
                break;
            }
            callback(self.message_from_line(line));
        }
        Ok(())
    }

    async fn health_check(&self) -> ChannelResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> ChannelResult<()> {
        Ok(())
    }
}
