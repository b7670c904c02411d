//! Shared types for the relay pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ─────────────────────────────────────────────────────

/// Platform channel identifier (numeric chat id or `@username`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// Platform message identifier, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Inbound message ─────────────────────────────────────────────────

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Other,
}

/// A media reference carried by a raw message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    /// Platform file id or URL. Never forwarded.
    pub reference: String,
}

impl Attachment {
    pub fn new(kind: MediaKind, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }
}

/// Link-preview metadata the platform attaches next to the text body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A message as received from a source channel. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub source_channel: ChannelId,
    /// Text body or media caption. May be empty.
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub link_preview: Option<LinkPreview>,
    pub timestamp: DateTime<Utc>,
}

impl RawMessage {
    /// Create a text-only message timestamped now.
    pub fn new(
        id: impl Into<String>,
        source_channel: impl Into<ChannelId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(id),
            source_channel: source_channel.into(),
            text: text.into(),
            attachments: Vec::new(),
            link_preview: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_link_preview(mut self, preview: LinkPreview) -> Self {
        self.link_preview = Some(preview);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn has_media(&self) -> bool {
        !self.attachments.is_empty()
    }
}

// ── Outbound payload ────────────────────────────────────────────────

/// Sanitized text ready for fan-out to target channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub source_message_id: MessageId,
    pub source_channel: ChannelId,
    pub text: String,
    pub target_channels: BTreeSet<ChannelId>,
}

// ── Admission decision ──────────────────────────────────────────────

/// Why a message was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NoLinkPattern,
    ExcludedKeyword,
    EmptyAfterSanitize,
    /// Only produced when the media policy drops media posts outright.
    MediaPresent,
}

impl DropReason {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoLinkPattern => "no_link_pattern",
            Self::ExcludedKeyword => "excluded_keyword",
            Self::EmptyAfterSanitize => "empty_after_sanitize",
            Self::MediaPresent => "media_present",
        }
    }
}

/// Result of evaluating one raw message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Forward(OutboundPayload),
    Drop(DropReason),
}

impl Admission {
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Forward(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_from_numeric() {
        let id = ChannelId::from(-1001234567890_i64);
        assert_eq!(id.as_str(), "-1001234567890");
        assert_eq!(id.to_string(), "-1001234567890");
    }

    #[test]
    fn raw_message_builder() {
        let msg = RawMessage::new("1", "-100", "hello")
            .with_attachment(Attachment::new(MediaKind::Photo, "AgAD123"));
        assert!(msg.has_media());
        assert_eq!(msg.attachments[0].kind, MediaKind::Photo);
        assert!(msg.link_preview.is_none());
    }

    #[test]
    fn drop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DropReason::NoLinkPattern).unwrap();
        assert_eq!(json, "\"no_link_pattern\"");
        assert_eq!(DropReason::ExcludedKeyword.label(), "excluded_keyword");
    }
}
