//! Streaming (SSE) replies from the Dify chat API.
//!
//! Agent apps only answer in streaming mode. The body is a sequence of
//! `data: <json>` lines, each JSON object tagged by its `event` field.
//! This module turns raw body chunks into typed [`StreamEvent`]s and folds
//! them into the ordered fragments of one reply.
//!
//! ```text
//! bytes ─▶ SseLineDecoder ─▶ parse_data_line ─▶ StreamReducer ─▶ StreamReply
//! ```
//!
//! The whole stream is consumed before the reply is returned, so nothing is
//! delivered to the user while the agent is still generating.

use relay_common::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Fragment;

// ============================================================================
// Event Types
// ============================================================================

/// One decoded event from the chat stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Answer delta from a chat app
    Message(MessageChunk),
    /// Answer delta from an agent app
    AgentMessage(MessageChunk),
    /// Agent reasoning / tool step; splits the answer into separate messages
    AgentThought(AgentThought),
    /// File produced by the agent
    MessageFile(MessageFile),
    /// Content moderation replacement (ignored)
    MessageReplace(MessageChunk),
    /// End of the answer
    MessageEnd(MessageEnd),
    /// Server side failure
    Error(StreamErrorEvent),
    /// Anything else (ping, workflow node events, ...)
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(default)]
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// File type reported by Dify; only "image" is rendered natively
    #[serde(rename = "type", default)]
    pub file_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub belongs_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnd {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl MessageEnd {
    pub fn usage(&self) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get("usage"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl StreamErrorEvent {
    fn describe(&self) -> String {
        format!(
            "status={} code={} message={}",
            self.status.map_or_else(|| "-".to_string(), |s| s.to_string()),
            self.code.as_deref().unwrap_or("-"),
            self.message.as_deref().unwrap_or("-"),
        )
    }
}

impl StreamEvent {
    /// Event name as sent on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::AgentMessage(_) => "agent_message",
            Self::AgentThought(_) => "agent_thought",
            Self::MessageFile(_) => "message_file",
            Self::MessageReplace(_) => "message_replace",
            Self::MessageEnd(_) => "message_end",
            Self::Error(_) => "error",
            Self::Other => "other",
        }
    }

    /// Conversation id carried by this event, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        let id = match self {
            Self::Message(e) | Self::AgentMessage(e) | Self::MessageReplace(e) => {
                e.conversation_id.as_deref()
            }
            Self::AgentThought(e) => e.conversation_id.as_deref(),
            Self::MessageFile(e) => e.conversation_id.as_deref(),
            Self::MessageEnd(e) => e.conversation_id.as_deref(),
            Self::Error(e) => e.conversation_id.as_deref(),
            Self::Other => None,
        };
        id.filter(|s| !s.is_empty())
    }
}

// ============================================================================
// Line Decoding
// ============================================================================

/// Splits a chunked SSE body into lines.
///
/// Bytes are buffered until a `\n` arrives, so a multi-byte character split
/// across chunks is decoded intact. A trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk and return the complete lines it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }
}

/// Decode one SSE line into an event.
///
/// Only `data:` lines carry events; blank lines, comments and other fields
/// yield `None`. A data line that is not a valid event is logged and skipped.
pub fn parse_data_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data).trim();
    if data.is_empty() {
        tracing::warn!("Received an empty SSE event");
        return None;
    }

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!(data = %data, error = %e, "Failed to decode JSON from SSE event");
            None
        }
    }
}

// ============================================================================
// Reduction
// ============================================================================

/// Fragments and conversation id assembled from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReply {
    pub fragments: Vec<Fragment>,
    pub conversation_id: String,
}

/// Whether the reducer wants more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Done,
}

/// Incremental fold of stream events into reply fragments.
///
/// Consecutive answer deltas are concatenated into one text fragment. A
/// thought, a file or the end event closes the current text. Events after
/// `message_end` are ignored.
#[derive(Debug, Default)]
pub struct StreamReducer {
    fragments: Vec<Fragment>,
    pending: String,
    conversation_id: Option<String>,
    done: bool,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.fragments
                .push(Fragment::Text(std::mem::take(&mut self.pending)));
        }
    }

    /// Fold one event. An `error` event aborts the whole reduction.
    pub fn push(&mut self, event: StreamEvent) -> Result<Flow> {
        if self.done {
            tracing::debug!(event = event.name(), "Ignoring event after message_end");
            return Ok(Flow::Done);
        }

        if self.conversation_id.is_none() {
            if let Some(id) = event.conversation_id() {
                self.conversation_id = Some(id.to_string());
            }
        }

        match event {
            StreamEvent::Message(chunk) | StreamEvent::AgentMessage(chunk) => {
                self.pending.push_str(&chunk.answer);
                tracing::trace!(accumulated = %self.pending, "Accumulated agent message");
            }
            StreamEvent::AgentThought(thought) => {
                self.flush();
                tracing::debug!(
                    position = ?thought.position,
                    tool = %thought.tool,
                    "Agent thought"
                );
            }
            StreamEvent::MessageFile(file) => {
                self.flush();
                if file.file_type == "image" {
                    self.fragments.push(Fragment::ImageUrl(file.url));
                } else {
                    tracing::warn!(
                        file_type = %file.file_type,
                        url = %file.url,
                        "Unsupported message file type, passing through as file"
                    );
                    self.fragments.push(Fragment::File(file.url));
                }
            }
            StreamEvent::MessageReplace(_) => {
                tracing::debug!("message_replace is not supported, ignoring");
            }
            StreamEvent::MessageEnd(end) => {
                self.flush();
                tracing::debug!(usage = ?end.usage(), "Stream finished");
                self.done = true;
                return Ok(Flow::Done);
            }
            StreamEvent::Error(err) => {
                let description = err.describe();
                tracing::error!(error = %description, "Stream error event");
                return Err(RelayError::RemoteStream(description));
            }
            StreamEvent::Other => {
                tracing::trace!("Skipping unhandled stream event");
            }
        }

        Ok(Flow::Continue)
    }

    /// Close the reduction. Fails if no event carried a conversation id.
    pub fn finish(mut self) -> Result<StreamReply> {
        self.flush();
        let conversation_id = self
            .conversation_id
            .ok_or_else(|| RelayError::RemoteStream("conversation id missing".to_string()))?;
        Ok(StreamReply {
            fragments: self.fragments,
            conversation_id,
        })
    }
}

/// Reduce a complete event sequence.
pub fn reduce_events<I>(events: I) -> Result<StreamReply>
where
    I: IntoIterator<Item = StreamEvent>,
{
    let mut reducer = StreamReducer::new();
    for event in events {
        if reducer.push(event)? == Flow::Done {
            break;
        }
    }
    reducer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(value: Value) -> Vec<StreamEvent> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_deltas_merge_into_one_message() {
        let reply = reduce_events(events(json!([
            {"event": "message", "answer": "Hel", "conversation_id": "c1"},
            {"event": "message", "answer": "lo"},
            {"event": "message_end", "metadata": {"usage": {}}}
        ])))
        .unwrap();

        assert_eq!(reply.fragments, vec![Fragment::text("Hello")]);
        assert_eq!(reply.conversation_id, "c1");
    }

    #[test]
    fn test_thought_and_file_split_messages() {
        let reply = reduce_events(events(json!([
            {"event": "agent_message", "answer": "Let me draw", "conversation_id": "c9"},
            {"event": "agent_thought", "thought": "calling dalle", "tool": "dalle3", "position": 1},
            {"event": "message_file", "type": "image", "url": "https://f/a.png", "belongs_to": "assistant"},
            {"event": "agent_message", "answer": "Here "},
            {"event": "agent_message", "answer": "it is"},
            {"event": "message_end", "conversation_id": "c9"}
        ])))
        .unwrap();

        assert_eq!(
            reply.fragments,
            vec![
                Fragment::text("Let me draw"),
                Fragment::ImageUrl("https://f/a.png".into()),
                Fragment::text("Here it is"),
            ]
        );
    }

    #[test]
    fn test_non_image_file_passes_through() {
        let reply = reduce_events(events(json!([
            {"event": "message_file", "type": "document", "url": "/files/r.pdf", "conversation_id": "c1"},
            {"event": "message_end"}
        ])))
        .unwrap();
        assert_eq!(reply.fragments, vec![Fragment::File("/files/r.pdf".into())]);
    }

    #[test]
    fn test_error_event_aborts() {
        let result = reduce_events(events(json!([
            {"event": "message", "answer": "partial", "conversation_id": "c1"},
            {"event": "error", "status": 400, "code": "invalid_param", "message": "bad"},
            {"event": "message_end"}
        ])));
        match result {
            Err(RelayError::RemoteStream(msg)) => {
                assert!(msg.contains("invalid_param"));
                assert!(msg.contains("bad"));
            }
            other => panic!("Expected RemoteStream, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_conversation_id_fails() {
        let result = reduce_events(events(json!([
            {"event": "message", "answer": "hi"},
            {"event": "message_end", "metadata": {"usage": {}}}
        ])));
        assert!(matches!(result, Err(RelayError::RemoteStream(m)) if m.contains("conversation id missing")));
    }

    #[test]
    fn test_events_after_end_are_dropped() {
        let reply = reduce_events(events(json!([
            {"event": "message", "answer": "done", "conversation_id": "c1"},
            {"event": "message_end"},
            {"event": "message", "answer": "late"},
            {"event": "error", "message": "late error"}
        ])))
        .unwrap();
        assert_eq!(reply.fragments, vec![Fragment::text("done")]);
    }

    #[test]
    fn test_replace_and_unknown_events_ignored() {
        let reply = reduce_events(events(json!([
            {"event": "ping"},
            {"event": "message", "answer": "a", "conversation_id": "c1"},
            {"event": "message_replace", "answer": "censored"},
            {"event": "workflow_started", "data": {}},
            {"event": "message", "answer": "b"},
            {"event": "message_end"}
        ])))
        .unwrap();
        assert_eq!(reply.fragments, vec![Fragment::text("ab")]);
    }

    #[test]
    fn test_first_conversation_id_wins() {
        let reply = reduce_events(events(json!([
            {"event": "agent_thought", "conversation_id": "first"},
            {"event": "agent_message", "answer": "x", "conversation_id": "second"},
            {"event": "message_end"}
        ])))
        .unwrap();
        assert_eq!(reply.conversation_id, "first");
    }

    #[test]
    fn test_stream_end_without_message_end_flushes() {
        let reply = reduce_events(events(json!([
            {"event": "message", "answer": "cut", "conversation_id": "c1"}
        ])))
        .unwrap();
        assert_eq!(reply.fragments, vec![Fragment::text("cut")]);
    }

    #[test]
    fn test_incremental_fold_reports_done() {
        let mut reducer = StreamReducer::new();
        let first: StreamEvent =
            serde_json::from_value(json!({"event": "message", "answer": "a", "conversation_id": "c"}))
                .unwrap();
        assert_eq!(reducer.push(first).unwrap(), Flow::Continue);
        let end: StreamEvent = serde_json::from_value(json!({"event": "message_end"})).unwrap();
        assert_eq!(reducer.push(end).unwrap(), Flow::Done);
        assert!(reducer.is_done());
    }

    #[test]
    fn test_line_decoder_handles_split_chunks() {
        let mut decoder = SseLineDecoder::new();
        let body = "data: {\"event\":\"message\",\"answer\":\"你好\"}\r\n\r\ndata: {\"event\":\"message_end\"}";
        let bytes = body.as_bytes();
        // split inside the multi-byte answer
        let split = body.find("你").unwrap() + 1;

        let mut lines = decoder.push(&bytes[..split]);
        assert!(lines.is_empty());
        lines.extend(decoder.push(&bytes[split..]));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "data: {\"event\":\"message\",\"answer\":\"你好\"}");
        assert_eq!(lines[1], "");
        assert_eq!(
            decoder.finish().as_deref(),
            Some("data: {\"event\":\"message_end\"}")
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_parse_data_line() {
        let event = parse_data_line(r#"data: {"event":"message","answer":"x"}"#).unwrap();
        assert_eq!(event.name(), "message");

        assert!(parse_data_line("").is_none());
        assert!(parse_data_line("event: ping").is_none());
        assert!(parse_data_line(": keep-alive").is_none());
        assert!(parse_data_line("data: ").is_none());
        assert!(parse_data_line("data: {not json").is_none());
        assert!(parse_data_line(r#"data: {"answer":"no tag"}"#).is_none());
    }
}
