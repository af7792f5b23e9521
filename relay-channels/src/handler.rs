//! Message handler that answers host messages through the Dify bot.

use async_trait::async_trait;
use relay_common::config::{config_dir, DifyConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bot::DifyBot;
use crate::inbound::{cache_first_image, should_reply, TurnIdentity};
use crate::media::MediaDownloader;
use crate::message::{ChannelMessage, OutgoingMessage};
use crate::outbound::compose_outgoing;
use crate::traits::{ChannelResult, MessageHandler};

/// Resolve the image cache directory. Relative paths live under the config directory.
pub fn resolve_cache_dir(dir: &str) -> PathBuf {
    let path = Path::new(dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir().join(path)
    }
}

/// Full inbound → Dify → outbound flow for one host message.
pub struct BotHandler {
    bot: Arc<DifyBot>,
    downloader: MediaDownloader,
    ignore_prefix: Vec<String>,
    /// Set when image upload is enabled
    image_cache_dir: Option<PathBuf>,
}

impl BotHandler {
    pub fn new(config: &DifyConfig, bot: Arc<DifyBot>) -> Self {
        Self {
            bot,
            downloader: MediaDownloader::new(),
            ignore_prefix: config.ignore_prefix.clone(),
            image_cache_dir: config
                .image_upload_enable
                .then(|| resolve_cache_dir(&config.image_cache_dir)),
        }
    }

    pub fn with_downloader(mut self, downloader: MediaDownloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_image_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.image_cache_dir = dir;
        self
    }

    async fn remember_image(&self, message: &ChannelMessage, identity: &TurnIdentity) {
        let Some(dir) = &self.image_cache_dir else {
            return;
        };
        if !self.bot.accepts_images() {
            tracing::debug!(adapter = %identity.adapter, "App mode takes no files, image ignored");
            return;
        }
        // session first, so the periodic purge sees the image's owner
        self.bot
            .sessions()
            .get_or_create(&identity.session_id, &identity.full_user_id);
        match cache_first_image(
            message,
            &identity.session_id,
            self.bot.images(),
            &self.downloader,
            dir,
        )
        .await
        {
            Ok(Some(image)) => {
                tracing::debug!(
                    adapter = %identity.adapter,
                    image_id = %image.id,
                    "Got image from host"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(adapter = %identity.adapter, error = %e, "Failed to fetch image from host");
            }
        }
    }
}

#[async_trait]
impl MessageHandler for BotHandler {
    async fn handle(&self, message: ChannelMessage) -> ChannelResult<Option<OutgoingMessage>> {
        if !should_reply(&message, &self.ignore_prefix) {
            return Ok(None);
        }

        let identity = TurnIdentity::from_message(&message);
        tracing::debug!(
            adapter = %identity.adapter,
            session_id = %identity.session_id,
            "Handling message"
        );

        if message.has_image() {
            self.remember_image(&message, &identity).await;
        }

        let reply = self
            .bot
            .reply(
                message.text.trim(),
                &identity.full_user_id,
                &identity.session_id,
            )
            .await;

        let mention = (!message.is_private).then_some(identity.user_id.as_str());
        let outgoing = compose_outgoing(reply, mention, &self.downloader).await?;
        Ok(Some(outgoing))
    }
}
