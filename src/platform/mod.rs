//! Messaging platform abstraction.
//!
//! The relay core only needs an inbound stream of raw messages and a way to
//! send text to a channel. Authentication, sessions and the wire protocol
//! stay behind this trait.

pub mod telegram;

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::PlatformError;
use crate::pipeline::types::{ChannelId, MessageId, RawMessage};

pub use telegram::TelegramPlatform;

/// Stream of raw messages from the subscribed source channels.
pub type MessageStream = Pin<Box<dyn Stream<Item = RawMessage> + Send>>;

/// Transport to a messaging platform.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Short transport name for logs.
    fn name(&self) -> &str;

    /// Subscribe to new messages posted in `sources`.
    ///
    /// The stream ends when the transport stops listening.
    async fn start(&self, sources: &BTreeSet<ChannelId>) -> Result<MessageStream, PlatformError>;

    /// Post `text` to `channel`.
    async fn send(&self, channel: &ChannelId, text: &str) -> Result<MessageId, PlatformError>;

    /// Verify credentials and connectivity.
    async fn health_check(&self) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Release transport resources.
    async fn shutdown(&self) -> Result<(), PlatformError> {
        Ok(())
    }
}
