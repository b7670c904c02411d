//! Configuration types.
//!
//! Everything is read once from environment-style key/value pairs at
//! startup and is read-only afterwards.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::filter::MediaPolicy;
use crate::pipeline::format::OutboundFormat;
use crate::pipeline::matcher::KeywordMatch;
use crate::pipeline::sanitizer::DEFAULT_MAX_TEXT_CHARS;
use crate::pipeline::types::ChannelId;

/// Link prefix of Binance red-packet claim pages.
pub const DEFAULT_REQUIRED_LINK: &str = "https://app.binance.com/uni-qr/cart/";

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Platform application id.
    pub api_id: i64,
    /// Platform application hash.
    pub api_hash: SecretString,
    /// Bot token used by the transport.
    pub bot_token: SecretString,
    /// Channels whose posts are inspected.
    pub source_channels: BTreeSet<ChannelId>,
    /// Channels that receive forwarded posts.
    pub target_channels: BTreeSet<ChannelId>,
    pub filter: FilterConfig,
    pub queue: QueueConfig,
    pub sender: SenderConfig,
}

/// Admission rules.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Literal link prefix, or a regex when prefixed with `re:`.
    pub required_link: String,
    /// Literal keywords, or regexes when prefixed with `re:`.
    pub excluded_keywords: Vec<String>,
    pub keyword_match: KeywordMatch,
    pub media_policy: MediaPolicy,
    pub format: OutboundFormat,
    /// Outbound text budget in characters.
    pub max_text_chars: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            required_link: DEFAULT_REQUIRED_LINK.to_string(),
            excluded_keywords: Vec::new(),
            keyword_match: KeywordMatch::default(),
            media_policy: MediaPolicy::default(),
            format: OutboundFormat::default(),
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }
}

/// Intake buffering.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum entries waiting in the dispatch queue.
    pub max_queue: usize,
    /// Buffer between the platform stream and the admission filter.
    pub inbound_buffer: usize,
    /// How many recent message ids are remembered for dedup.
    pub dedup_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue: 256,
            inbound_buffer: 1024,
            dedup_window: 1024,
        }
    }
}

/// Outbound pacing and retry policy, applied per target channel.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Sustained sends per second per channel.
    pub rate_per_sec: f64,
    /// Sends allowed back-to-back before pacing kicks in.
    pub burst: u32,
    /// Retries after throttle/transient errors before giving up.
    pub max_retries: u32,
    /// First backoff step; doubles per retry.
    pub backoff_base: Duration,
    /// Upper bound for computed backoff (platform `retry_after` may exceed it).
    pub backoff_max: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 1.0,
            burst: 3,
            max_retries: 5,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(60_000),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let api_id = env.required("API_ID", "Application id from my.telegram.org")?;
        let api_id: i64 = parse_value("API_ID", &api_id)?;
        let api_hash = SecretString::from(
            env.required("API_HASH", "Application hash from my.telegram.org")?,
        );
        let bot_token = SecretString::from(env.required("BOT_TOKEN", "Token issued by @BotFather")?);

        let source_channels = env.channels("SOURCE_CHANNELS")?;
        let target_channels = env.channels("TARGET_CHANNELS")?;
        if let Some(both) = source_channels.intersection(&target_channels).next() {
            return Err(ConfigError::InvalidValue {
                key: "TARGET_CHANNELS".into(),
                message: format!("channel {both} is also a source channel"),
            });
        }

        let filter_defaults = FilterConfig::default();
        let filter = FilterConfig {
            required_link: env
                .get("RELAY_REQUIRED_LINK")
                .unwrap_or(filter_defaults.required_link),
            excluded_keywords: env.list("RELAY_EXCLUDED_KEYWORDS"),
            keyword_match: KeywordMatch {
                case_sensitive: env.parse_or("RELAY_KEYWORD_CASE_SENSITIVE", false)?,
                whole_word: env.parse_or("RELAY_KEYWORD_WHOLE_WORD", false)?,
            },
            media_policy: env.parse_or("RELAY_MEDIA_POLICY", filter_defaults.media_policy)?,
            format: env.parse_or("RELAY_FORMAT", filter_defaults.format)?,
            max_text_chars: env.parse_or("RELAY_MAX_TEXT_CHARS", filter_defaults.max_text_chars)?,
        };
        ensure_positive("RELAY_MAX_TEXT_CHARS", filter.max_text_chars)?;

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            max_queue: env.parse_or("RELAY_MAX_QUEUE", queue_defaults.max_queue)?,
            inbound_buffer: env.parse_or("RELAY_INBOUND_BUFFER", queue_defaults.inbound_buffer)?,
            dedup_window: env.parse_or("RELAY_DEDUP_WINDOW", queue_defaults.dedup_window)?,
        };
        ensure_positive("RELAY_MAX_QUEUE", queue.max_queue)?;
        ensure_positive("RELAY_INBOUND_BUFFER", queue.inbound_buffer)?;

        let sender_defaults = SenderConfig::default();
        let sender = SenderConfig {
            rate_per_sec: env.parse_or("RELAY_SEND_RATE", sender_defaults.rate_per_sec)?,
            burst: env.parse_or("RELAY_SEND_BURST", sender_defaults.burst)?,
            max_retries: env.parse_or("RELAY_MAX_RETRIES", sender_defaults.max_retries)?,
            backoff_base: Duration::from_millis(env.parse_or(
                "RELAY_BACKOFF_BASE_MS",
                sender_defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(env.parse_or(
                "RELAY_BACKOFF_MAX_MS",
                sender_defaults.backoff_max.as_millis() as u64,
            )?),
        };
        sender.validate()?;

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            source_channels,
            target_channels,
            filter,
            queue,
            sender,
        })
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_SEND_RATE".into(),
                message: format!("must be a positive number, got {}", self.rate_per_sec),
            });
        }
        ensure_positive("RELAY_SEND_BURST", self.burst as usize)?;
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_BACKOFF_BASE_MS".into(),
                message: "must not exceed RELAY_BACKOFF_MAX_MS".into(),
            });
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value for `key`, trimmed.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str, hint: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingRequired {
            key: key.into(),
            hint: hint.into(),
        })
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Comma-separated list, blanks removed.
    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Required, non-empty comma-separated channel list.
    fn channels(&self, key: &str) -> Result<BTreeSet<ChannelId>, ConfigError> {
        if self.get(key).is_none() {
            return Err(ConfigError::MissingRequired {
                key: key.into(),
                hint: "Set it to a comma-separated list of channel ids or @usernames.".into(),
            });
        }
        let channels: BTreeSet<ChannelId> = self
            .list(key)
            .into_iter()
            .map(ChannelId::new)
            .collect();
        if channels.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key.into(),
                message: "at least one channel id is required".into(),
            });
        }
        Ok(channels)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.into(),
        message: format!("{raw:?}: {e}"),
    })
}

fn ensure_positive(key: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(())
}
