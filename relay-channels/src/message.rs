//! Message types for channel communication.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Reply Fragments
// ============================================================================

/// Kind of a reply fragment, as seen by the host adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Text,
    ImageUrl,
    File,
}

impl FragmentKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ImageUrl => "image_url",
            Self::File => "file",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed unit of outbound content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Fragment {
    Text(String),
    ImageUrl(String),
    File(String),
}

impl Fragment {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub const fn kind(&self) -> FragmentKind {
        match self {
            Self::Text(_) => FragmentKind::Text,
            Self::ImageUrl(_) => FragmentKind::ImageUrl,
            Self::File(_) => FragmentKind::File,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Text(s) | Self::ImageUrl(s) | Self::File(s) => s,
        }
    }

    pub fn into_content(self) -> String {
        match self {
            Self::Text(s) | Self::ImageUrl(s) | Self::File(s) => s,
        }
    }
}

/// Ordered reply for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub fragments: Vec<Fragment>,
}

impl Reply {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self { fragments }
    }

    /// Reply made of a single text fragment.
    pub fn text(s: impl Into<String>) -> Self {
        Self::new(vec![Fragment::text(s)])
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn kinds(&self) -> Vec<FragmentKind> {
        self.fragments.iter().map(Fragment::kind).collect()
    }

    pub fn contents(&self) -> Vec<&str> {
        self.fragments.iter().map(Fragment::content).collect()
    }

    /// Split into the parallel (kinds, contents) sequences hosts consume.
    pub fn into_parts(self) -> (Vec<FragmentKind>, Vec<String>) {
        self.fragments
            .into_iter()
            .map(|f| (f.kind(), f.into_content()))
            .unzip()
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Image attached to an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundImage {
    /// Host-side image identifier, usually a file name
    pub id: String,
    /// Where the host lets us fetch the bytes
    pub url: String,
    /// MIME type if the host reports one
    pub mime_type: Option<String>,
}

/// Unified inbound message delivered by a host adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message ID (host-specific)
    pub id: String,
    /// Host adapter name (e.g. "onebot", "telegram"), if known
    pub adapter: Option<String>,
    /// User identifier, if the host exposes one
    pub user_id: Option<String>,
    /// Plain text of the message
    pub text: String,
    /// Direct chat rather than a group
    pub is_private: bool,
    /// The bot was addressed (mentioned, replied to, or direct chat)
    pub is_to_me: bool,
    /// Images in the message, in order
    #[serde(default)]
    pub images: Vec<InboundImage>,
    /// Timestamp (Unix millis)
    pub timestamp: i64,
}

impl ChannelMessage {
    /// Plain text message in a direct chat.
    pub fn private_text(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            adapter: None,
            user_id: Some(user_id.into()),
            text: text.into(),
            is_private: true,
            is_to_me: true,
            images: Vec::new(),
            timestamp: now_millis(),
        }
    }

    pub fn has_image(&self) -> bool {
        !self.images.is_empty()
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ============================================================================
// Outbound
// ============================================================================

/// One rendered piece of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingSegment {
    /// Mention of a user in a group chat
    Mention(String),
    /// Plain text
    Text(String),
    /// Downloaded image bytes
    Image(Vec<u8>),
}

/// Composite outbound message handed back to the host for delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub segments: Vec<OutgoingSegment>,
}

impl OutgoingMessage {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Text segments joined, for channels that can only print text.
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                OutgoingSegment::Mention(user) => format!("@{user}"),
                OutgoingSegment::Text(text) => text.clone(),
                OutgoingSegment::Image(bytes) => format!("[Image: {} bytes]", bytes.len()),
            })
            .collect()
    }
}
