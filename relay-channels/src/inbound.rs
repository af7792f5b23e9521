//! Inbound side of the host glue: which messages trigger a turn, who sent
//! them, and caching the image that will accompany the next request.

use relay_common::error::Result;
use std::path::Path;

use crate::media::{save_image, CachedImage, ImageCache, MediaDownloader};
use crate::message::ChannelMessage;

/// Adapter name used when the host does not report one.
pub const DEFAULT_ADAPTER: &str = "default";
/// User id used when the host does not report one.
pub const DEFAULT_USER: &str = "user";

/// Decide whether a message should be answered.
///
/// Messages whose trimmed text starts with an ignore prefix are skipped.
/// Everything else is answered only when addressed to the bot.
pub fn should_reply(message: &ChannelMessage, ignore_prefix: &[String]) -> bool {
    let text = message.text.trim();
    if text.is_empty() {
        tracing::debug!(message_id = %message.id, "Ignored empty plaintext message");
        return false;
    }
    if let Some(prefix) = ignore_prefix
        .iter()
        .find(|p| !p.is_empty() && text.starts_with(p.as_str()))
    {
        tracing::debug!(message_id = %message.id, prefix = %prefix, "Ignored prefixed message");
        return false;
    }
    message.is_to_me || message.is_private
}

/// Who a turn belongs to, derived from the host's identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnIdentity {
    /// Lower-cased adapter name
    pub adapter: String,
    /// Host user id
    pub user_id: String,
    /// `{adapter}-{user_id}`, sent to Dify as the user
    pub full_user_id: String,
    /// `s-{full_user_id}`, the session key
    pub session_id: String,
}

impl TurnIdentity {
    pub fn new(adapter: Option<&str>, user_id: Option<&str>) -> Self {
        let adapter = adapter
            .map(|a| a.trim().trim_start_matches("SupportAdapter.").to_lowercase())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| DEFAULT_ADAPTER.to_string());
        let user_id = user_id
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_USER)
            .to_string();
        let full_user_id = format!("{adapter}-{user_id}");
        let session_id = format!("s-{full_user_id}");

        Self {
            adapter,
            user_id,
            full_user_id,
            session_id,
        }
    }

    pub fn from_message(message: &ChannelMessage) -> Self {
        Self::new(message.adapter.as_deref(), message.user_id.as_deref())
    }
}

/// Fetch the message's first image and remember it for the session.
///
/// Returns `Ok(None)` when the message has no image.
pub async fn cache_first_image(
    message: &ChannelMessage,
    session_id: &str,
    cache: &ImageCache,
    downloader: &MediaDownloader,
    dir: &Path,
) -> Result<Option<CachedImage>> {
    let Some(image) = message.images.first() else {
        return Ok(None);
    };

    let bytes = downloader.download(&image.url).await?;
    let path = save_image(&bytes, &image.id, image.mime_type.as_deref(), dir).await?;
    let cached = CachedImage {
        id: image.id.clone(),
        path,
    };
    cache.insert(session_id, cached.clone()).await;
    Ok(Some(cached))
}
