//! Outbound text formatting.
//!
//! `Verbatim` forwards the sanitized text unchanged. `RedPacket` rewrites
//! crypto red-packet posts into a fixed card layout:
//!
//! ```text
//! ❤️‍🩹 BNB ❤️‍🩹
//! 💎 100 | ~0.05 BNB
//! 💰 ~30.12 USDT
//!
//! Answer:
//! moon❕moon❕
//!
//! #square #slot
//! ```

use std::str::FromStr;

use regex::Regex;

use crate::error::ConfigError;

/// Which outbound layout to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutboundFormat {
    #[default]
    Verbatim,
    RedPacket,
}

impl FromStr for OutboundFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "verbatim" => Ok(Self::Verbatim),
            "red_packet" | "red-packet" => Ok(Self::RedPacket),
            other => Err(ConfigError::InvalidValue {
                key: "RELAY_FORMAT".into(),
                message: format!("unknown format {other:?} (expected verbatim or red_packet)"),
            }),
        }
    }
}

/// Applies an [`OutboundFormat`] to sanitized text.
#[derive(Debug, Clone)]
pub enum Formatter {
    Verbatim,
    RedPacket(RedPacketFormatter),
}

impl Formatter {
    pub fn new(format: OutboundFormat) -> Result<Self, ConfigError> {
        match format {
            OutboundFormat::Verbatim => Ok(Self::Verbatim),
            OutboundFormat::RedPacket => RedPacketFormatter::new().map(Self::RedPacket),
        }
    }

    pub fn format(&self, text: &str) -> String {
        match self {
            Self::Verbatim => text.to_string(),
            Self::RedPacket(f) => f.format(text),
        }
    }
}

/// Extracts token, amount, USDT value and quiz answer from a red-packet post.
#[derive(Debug, Clone)]
pub struct RedPacketFormatter {
    token: Regex,
    amount: Regex,
    usdt: Regex,
    copy_marker: Regex,
    bangs: Regex,
}

impl RedPacketFormatter {
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            token: compile(r"^([A-Z]+)")?,
            amount: compile(r"(\d+ \| ~[\d.]+ [A-Z]+)")?,
            usdt: compile(r"(~[\d.]+ USDT)")?,
            copy_marker: compile(r"copy\s*[^\w\s]*")?,
            bangs: compile(r"!+")?,
        })
    }

    pub fn format(&self, text: &str) -> String {
        let token = self.capture(&self.token, text).unwrap_or("CRYPTO");
        let amount = self.capture(&self.amount, text).unwrap_or_default();
        let usdt = self.capture(&self.usdt, text).unwrap_or_default();
        let answer = self.answer(text);

        format!(
            "❤️‍🩹 {token} ❤️‍🩹\n💎 {amount}\n💰 {usdt}\n\nAnswer:\n{answer}❕{answer}❕\n\n#square #slot"
        )
    }

    fn capture<'t>(&self, regex: &Regex, text: &'t str) -> Option<&'t str> {
        regex
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    /// Text after `Answer:` up to the first hashtag line, cleaned up.
    fn answer(&self, text: &str) -> String {
        let Some(start) = text.find("Answer:") else {
            return String::new();
        };
        let rest = &text[start + "Answer:".len()..];
        let end = rest.find("\n#").unwrap_or(rest.len());
        let answer = rest[..end].trim();
        let answer = self.copy_marker.replace_all(answer, "");
        self.bangs.replace_all(&answer, "❕").trim().to_string()
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!("verbatim".parse::<OutboundFormat>().unwrap(), OutboundFormat::Verbatim);
        assert_eq!("".parse::<OutboundFormat>().unwrap(), OutboundFormat::Verbatim);
        assert_eq!(
            "Red_Packet".parse::<OutboundFormat>().unwrap(),
            OutboundFormat::RedPacket
        );
        assert!("fancy".parse::<OutboundFormat>().is_err());
    }

    #[test]
    fn verbatim_passes_text_through() {
        let f = Formatter::new(OutboundFormat::Verbatim).unwrap();
        assert_eq!(f.format("hello\nworld"), "hello\nworld");
    }

    #[test]
    fn red_packet_layout() {
        let f = Formatter::new(OutboundFormat::RedPacket).unwrap();
        let text = "BNB red packet\n100 | ~0.05 BNB\n~30.12 USDT\nAnswer: moon copy 👉\n#binance";
        assert_eq!(
            f.format(text),
            "❤️‍🩹 BNB ❤️‍🩹\n💎 100 | ~0.05 BNB\n💰 ~30.12 USDT\n\nAnswer:\nmoon❕moon❕\n\n#square #slot"
        );
    }

    #[test]
    fn red_packet_replaces_exclamation_runs() {
        let f = RedPacketFormatter::new().unwrap();
        assert_eq!(f.answer("Answer: go!!! now!"), "go❕ now❕");
    }

    #[test]
    fn red_packet_defaults_when_fields_missing() {
        let f = RedPacketFormatter::new().unwrap();
        let out = f.format("lowercase start, nothing else");
        assert!(out.starts_with("❤️‍🩹 CRYPTO ❤️‍🩹\n💎 \n💰 \n"));
        assert!(out.contains("Answer:\n❕❕"));
    }
}
