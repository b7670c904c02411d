//! Admission filter — decides whether a raw message is forwarded.
//!
//! Composition of the pattern matcher, sanitizer and formatter:
//! 1. `PatternMatcher::check()` — cheap, rejects most traffic
//! 2. media policy — optional rejection of media posts
//! 3. `ContentSanitizer::sanitize()` — only for admissible messages
//! 4. required link re-checked on the sanitized text
//! 5. `Formatter::format()` — outbound layout, capped at the text budget
//!
//! The result is identical whatever the order of 1–3; matching first only
//! avoids sanitizing messages that are dropped anyway. Step 4 catches links
//! lost to truncation or to attachment-reference removal.

use std::collections::BTreeSet;
use std::str::FromStr;

use tracing::debug;

use crate::config::FilterConfig;
use crate::error::ConfigError;
use crate::pipeline::format::Formatter;
use crate::pipeline::matcher::PatternMatcher;
use crate::pipeline::sanitizer::ContentSanitizer;
use crate::pipeline::types::{Admission, ChannelId, DropReason, OutboundPayload, RawMessage};

/// What to do with messages that carry media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaPolicy {
    /// Forward the text, drop the media.
    #[default]
    Strip,
    /// Do not forward media posts at all.
    DropMessage,
}

impl FromStr for MediaPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "strip" => Ok(Self::Strip),
            "drop" | "drop_message" => Ok(Self::DropMessage),
            other => Err(ConfigError::InvalidValue {
                key: "RELAY_MEDIA_POLICY".into(),
                message: format!("unknown media policy {other:?} (expected strip or drop)"),
            }),
        }
    }
}

/// Stateless admission decision over raw messages.
///
/// Holds only read-only rules, so one instance is shared across tasks.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    matcher: PatternMatcher,
    sanitizer: ContentSanitizer,
    formatter: Formatter,
    media_policy: MediaPolicy,
    targets: BTreeSet<ChannelId>,
}

impl AdmissionFilter {
    pub fn new(
        matcher: PatternMatcher,
        sanitizer: ContentSanitizer,
        formatter: Formatter,
        media_policy: MediaPolicy,
        targets: BTreeSet<ChannelId>,
    ) -> Self {
        Self {
            matcher,
            sanitizer,
            formatter,
            media_policy,
            targets,
        }
    }

    /// Build the filter from configuration, compiling all patterns.
    pub fn from_config(
        config: &FilterConfig,
        targets: BTreeSet<ChannelId>,
    ) -> Result<Self, ConfigError> {
        let matcher = PatternMatcher::new(
            &config.required_link,
            &config.excluded_keywords,
            config.keyword_match,
        )?;
        Ok(Self::new(
            matcher,
            ContentSanitizer::new(config.max_text_chars),
            Formatter::new(config.format)?,
            config.media_policy,
            targets,
        ))
    }

    /// Decide whether `message` is forwarded, and with what text.
    pub fn evaluate(&self, message: &RawMessage) -> Admission {
        match self.admit(message) {
            Ok(payload) => Admission::Forward(payload),
            Err(reason) => {
                debug!(
                    id = %message.id,
                    channel = %message.source_channel,
                    reason = reason.label(),
                    "Message dropped by admission filter"
                );
                Admission::Drop(reason)
            }
        }
    }

    fn admit(&self, message: &RawMessage) -> Result<OutboundPayload, DropReason> {
        self.matcher.check(&message.text)?;

        if self.media_policy == MediaPolicy::DropMessage && message.has_media() {
            return Err(DropReason::MediaPresent);
        }

        let sanitized = self.sanitizer.sanitize(message);
        if sanitized.is_empty() {
            return Err(DropReason::EmptyAfterSanitize);
        }
        if !self.matcher.has_required_link(&sanitized) {
            return Err(DropReason::NoLinkPattern);
        }

        Ok(OutboundPayload {
            source_message_id: message.id.clone(),
            source_channel: message.source_channel.clone(),
            text: self.sanitizer.truncate(&self.formatter.format(&sanitized)),
            target_channels: self.targets.clone(),
        })
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    pub fn targets(&self) -> &BTreeSet<ChannelId> {
        &self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::format::OutboundFormat;
    use crate::pipeline::matcher::KeywordMatch;
    use crate::pipeline::types::{Attachment, MediaKind};

    const LINK: &str = "https://app.binance.com/uni-qr/cart/";

    fn filter_with(keywords: &[&str], media_policy: MediaPolicy) -> AdmissionFilter {
        filter_formatted(keywords, media_policy, OutboundFormat::Verbatim)
    }

    fn filter_formatted(
        keywords: &[&str],
        media_policy: MediaPolicy,
        format: OutboundFormat,
    ) -> AdmissionFilter {
        let config = FilterConfig {
            required_link: LINK.into(),
            excluded_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            keyword_match: KeywordMatch::default(),
            media_policy,
            format,
            max_text_chars: 4096,
        };
        let targets = ["-1001", "-1002"].into_iter().map(ChannelId::from).collect();
        AdmissionFilter::from_config(&config, targets).unwrap()
    }

    #[test]
    fn forwards_link_with_photo_stripped() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let msg = RawMessage::new(
            "7",
            "-100",
            "Check this out https://app.binance.com/uni-qr/cart/abc123",
        )
        .with_attachment(Attachment::new(MediaKind::Photo, "AgADBAADq6cxG"));

        match filter.evaluate(&msg) {
            Admission::Forward(payload) => {
                assert_eq!(
                    payload.text,
                    "Check this out https://app.binance.com/uni-qr/cart/abc123"
                );
                assert!(!payload.text.contains("AgADBAADq6cxG"));
                assert_eq!(payload.source_message_id.as_str(), "7");
                assert_eq!(payload.target_channels.len(), 2);
            }
            other => panic!("Expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn drops_excluded_keyword_even_with_link() {
        let filter = filter_with(&["scam"], MediaPolicy::Strip);
        let msg = RawMessage::new("1", "-100", "scam alert https://app.binance.com/uni-qr/cart/xyz");
        assert_eq!(filter.evaluate(&msg), Admission::Drop(DropReason::ExcludedKeyword));
    }

    #[test]
    fn drops_message_without_link() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let msg = RawMessage::new("1", "-100", "hello world");
        assert_eq!(filter.evaluate(&msg), Admission::Drop(DropReason::NoLinkPattern));
    }

    #[test]
    fn drops_media_only_message() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let msg = RawMessage::new("1", "-100", "")
            .with_attachment(Attachment::new(MediaKind::Video, "BAAD"));
        assert_eq!(filter.evaluate(&msg), Admission::Drop(DropReason::NoLinkPattern));
    }

    #[test]
    fn drops_when_only_the_attachment_reference_carried_the_link() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let reference = "https://app.binance.com/uni-qr/cart/file.jpg";
        let msg = RawMessage::new("1", "-100", reference)
            .with_attachment(Attachment::new(MediaKind::Document, reference));
        assert_eq!(
            filter.evaluate(&msg),
            Admission::Drop(DropReason::EmptyAfterSanitize)
        );
    }

    #[test]
    fn drops_when_attachment_reference_removal_cuts_the_link() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let reference = "https://app.binance.com/uni-qr/cart/file.jpg";
        let msg = RawMessage::new("1", "-100", format!("Grab it {reference}"))
            .with_attachment(Attachment::new(MediaKind::Document, reference));
        assert_eq!(filter.evaluate(&msg), Admission::Drop(DropReason::NoLinkPattern));
    }

    #[test]
    fn drops_when_truncation_cuts_the_link() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        let text = format!("{} https://app.binance.com/uni-qr/cart/abc", "x".repeat(4090));
        let msg = RawMessage::new("1", "-100", text);
        assert_eq!(filter.evaluate(&msg), Admission::Drop(DropReason::NoLinkPattern));
    }

    #[test]
    fn red_packet_output_stays_within_budget() {
        let filter = filter_formatted(&[], MediaPolicy::Strip, OutboundFormat::RedPacket);
        let text = format!(
            "BNB https://app.binance.com/uni-qr/cart/abc\nAnswer: {}",
            "word ".repeat(900)
        );
        let msg = RawMessage::new("1", "-100", text);
        let Admission::Forward(payload) = filter.evaluate(&msg) else {
            panic!("Expected Forward");
        };
        assert!(payload.text.starts_with("❤️‍🩹 BNB ❤️‍🩹"));
        assert!(payload.text.chars().count() <= 4096);
    }

    #[test]
    fn media_policy_drop_rejects_media_posts() {
        let filter = filter_with(&[], MediaPolicy::DropMessage);
        let text = "https://app.binance.com/uni-qr/cart/abc";
        let with_media = RawMessage::new("1", "-100", text)
            .with_attachment(Attachment::new(MediaKind::Photo, "AgAD"));
        assert_eq!(filter.evaluate(&with_media), Admission::Drop(DropReason::MediaPresent));

        let text_only = RawMessage::new("2", "-100", text);
        assert!(filter.evaluate(&text_only).is_forward());
    }

    #[test]
    fn no_attachment_reference_survives_any_count() {
        let filter = filter_with(&[], MediaPolicy::Strip);
        for count in 0..6 {
            let mut msg = RawMessage::new(
                count.to_string(),
                "-100",
                format!("ref_0 https://app.binance.com/uni-qr/cart/a ref_{count}"),
            );
            for i in 0..=count {
                msg = msg.with_attachment(Attachment::new(MediaKind::Photo, format!("ref_{i}")));
            }
            let Admission::Forward(payload) = filter.evaluate(&msg) else {
                panic!("Expected Forward for {count} attachments");
            };
            for attachment in &msg.attachments {
                assert!(!payload.text.contains(&attachment.reference));
            }
        }
    }

    #[test]
    fn media_policy_parsing() {
        assert_eq!("strip".parse::<MediaPolicy>().unwrap(), MediaPolicy::Strip);
        assert_eq!("DROP".parse::<MediaPolicy>().unwrap(), MediaPolicy::DropMessage);
        assert!("keep".parse::<MediaPolicy>().is_err());
    }
}
