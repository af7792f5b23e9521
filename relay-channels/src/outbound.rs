//! Rendering a reply into the host's composite message.

use relay_common::error::Result;

use crate::media::MediaDownloader;
use crate::message::{Fragment, OutgoingMessage, OutgoingSegment, Reply};

/// Build the outgoing message for a reply.
///
/// Fragments map to segments in order. Image links are downloaded so the
/// host sends the picture itself; text and file links go out as text. In a
/// group chat (`mention = Some(user)`) the message opens with a mention of
/// the user followed by a newline.
///
/// A failed image download fails the whole message.
pub async fn compose_outgoing(
    reply: Reply,
    mention: Option<&str>,
    downloader: &MediaDownloader,
) -> Result<OutgoingMessage> {
    let mut segments = Vec::with_capacity(reply.len() + 2);

    if let Some(user) = mention {
        segments.push(OutgoingSegment::Mention(user.to_string()));
        segments.push(OutgoingSegment::Text("\n".to_string()));
    }

    for fragment in reply.fragments {
        match fragment {
            Fragment::ImageUrl(url) => {
                let bytes = downloader.download(&url).await?;
                segments.push(OutgoingSegment::Image(bytes));
            }
            Fragment::Text(text) | Fragment::File(text) => {
                segments.push(OutgoingSegment::Text(text));
            }
        }
    }

    Ok(OutgoingMessage { segments })
}
