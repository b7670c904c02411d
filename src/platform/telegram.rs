//! Telegram transport — long-polls the Bot API for channel posts and
//! forwards text with `sendMessage`.
//!
//! The bot must be a member of every source channel (to receive
//! `channel_post` updates) and an admin of every target channel.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::PlatformError;
use crate::pipeline::types::{Attachment, ChannelId, LinkPreview, MediaKind, MessageId, RawMessage};
use crate::platform::{MessageStream, Platform};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Used when a 429 arrives without `parameters.retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Buffer between the poll task and the relay.
const UPDATE_BUFFER: usize = 256;

/// Media fields of a Telegram message, in the order they are checked.
const MEDIA_FIELDS: &[(&str, MediaKind)] = &[
    ("photo", MediaKind::Photo),
    ("video", MediaKind::Video),
    ("animation", MediaKind::Animation),
    ("document", MediaKind::Document),
    ("audio", MediaKind::Audio),
    ("voice", MediaKind::Voice),
    ("video_note", MediaKind::Video),
    ("sticker", MediaKind::Sticker),
];

/// Telegram Bot API transport.
pub struct TelegramPlatform {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    stopped: Arc<AtomicBool>,
}

impl TelegramPlatform {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Point at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        method_url(&self.api_base, &self.bot_token, method)
    }
}

fn method_url(api_base: &str, bot_token: &SecretString, method: &str) -> String {
    format!("{api_base}/bot{}/{method}", bot_token.expose_secret())
}

#[async_trait]
impl Platform for TelegramPlatform {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self, sources: &BTreeSet<ChannelId>) -> Result<MessageStream, PlatformError> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        let url = self.api_url("getUpdates");
        let client = self.client.clone();
        let sources = sources.clone();
        let stopped = Arc::clone(&self.stopped);
        stopped.store(false, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut offset: i64 = 0;
            tracing::info!(sources = sources.len(), "Telegram listening for channel posts");

            while !stopped.load(Ordering::SeqCst) {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["channel_post", "message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    let description = data
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("missing result");
                    tracing::warn!("Telegram getUpdates failed: {description}");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(message) = parse_update(update, &sources) else {
                        continue;
                    };

                    if tx.send(message).await.is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
            tracing::info!("Telegram poller stopped");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn send(&self, channel: &ChannelId, text: &str) -> Result<MessageId, PlatformError> {
        let body = serde_json::json!({
            "chat_id": channel.as_str(),
            "text": text,
            "link_preview_options": { "is_disabled": true }
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let status = resp.status().as_u16();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| PlatformError::Transient(format!("HTTP {status}: {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            let message_id = data
                .get("result")
                .and_then(|r| r.get("message_id"))
                .and_then(Value::as_i64)
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Ok(MessageId::new(message_id));
        }

        Err(classify_error(status, &data))
    }

    async fn health_check(&self) -> Result<(), PlatformError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let data: Value = resp.json().await.unwrap_or_default();
        Err(classify_error(status.as_u16(), &data))
    }

    async fn shutdown(&self) -> Result<(), PlatformError> {
        tracing::info!("Telegram transport shutting down");
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a failed Bot API response onto the relay's error kinds.
fn classify_error(status: u16, body: &Value) -> PlatformError {
    let code = body
        .get("error_code")
        .and_then(Value::as_u64)
        .map_or(status, |c| c as u16);
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match code {
        429 => {
            let retry_after = body
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            PlatformError::Throttled { retry_after }
        }
        401 | 403 => PlatformError::PermissionDenied,
        404 => PlatformError::NotFound,
        400 if description.to_lowercase().contains("chat not found") => PlatformError::NotFound,
        400..=499 => PlatformError::Rejected(format!("{code}: {description}")),
        _ => PlatformError::Transient(format!("{code}: {description}")),
    }
}

/// Turn one `getUpdates` entry into a [`RawMessage`] if it was posted in
/// one of `sources`. Sources may be listed by numeric id or `@username`.
fn parse_update(update: &Value, sources: &BTreeSet<ChannelId>) -> Option<RawMessage> {
    let message = update
        .get("channel_post")
        .or_else(|| update.get("message"))?;
    let chat = message.get("chat")?;

    let chat_id = chat.get("id").and_then(Value::as_i64).map(ChannelId::from)?;
    let by_username = chat
        .get("username")
        .and_then(Value::as_str)
        .map(|u| ChannelId::new(format!("@{u}")));

    let source_channel = if sources.contains(&chat_id) {
        chat_id
    } else {
        match by_username {
            Some(name) if sources.contains(&name) => name,
            _ => {
                tracing::debug!(chat = %chat_id, "Ignoring update from unconfigured chat");
                return None;
            }
        }
    };

    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut raw = RawMessage::new(message_id.to_string(), source_channel, text);

    if let Some(date) = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    {
        raw = raw.with_timestamp(date);
    }

    for (field, kind) in MEDIA_FIELDS {
        let Some(media) = message.get(*field) else {
            continue;
        };
        // Photos arrive as an array of sizes; the last one is the largest.
        let media = media.as_array().and_then(|sizes| sizes.last()).unwrap_or(media);
        let reference = media
            .get("file_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        raw = raw.with_attachment(Attachment::new(*kind, reference));
    }

    if let Some(options) = message.get("link_preview_options")
        && options.get("is_disabled").and_then(Value::as_bool) != Some(true)
    {
        raw = raw.with_link_preview(LinkPreview {
            url: options.get("url").and_then(Value::as_str).map(String::from),
            title: None,
            description: None,
        });
    }

    Some(raw)
}

// ── Tests ───────────────────────────────────────────────────────────
