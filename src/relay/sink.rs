//! Terminal delivery failures and where they are reported.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::error::PlatformError;
use crate::pipeline::types::{ChannelId, MessageId};

/// Why a delivery was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// Non-retriable platform response.
    Rejected { error: String },
    /// Throttle/transient responses exceeded the retry budget.
    RetriesExhausted { retries: u32, last_error: String },
    /// No lane exists for the target channel.
    NoLane,
}

impl FailureCause {
    pub fn rejected(error: &PlatformError) -> Self {
        Self::Rejected {
            error: error.to_string(),
        }
    }
}

/// One abandoned delivery, with enough ids for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub entry_id: Uuid,
    pub source_message_id: MessageId,
    pub channel: ChannelId,
    pub cause: FailureCause,
}

/// Receives terminal delivery failures.
pub trait FailureSink: Send + Sync {
    fn report(&self, failure: &DeliveryFailure);
}

/// Default sink: one error-level log line per failure.
#[derive(Debug, Default)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn report(&self, failure: &DeliveryFailure) {
        let cause = serde_json::to_string(&failure.cause).unwrap_or_default();
        error!(
            entry_id = %failure.entry_id,
            source_id = %failure.source_message_id,
            channel = %failure.channel,
            cause = %cause,
            "Delivery failed permanently"
        );
    }
}

/// Keeps failures in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    failures: Mutex<Vec<DeliveryFailure>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

impl FailureSink for MemorySink {
    fn report(&self, failure: &DeliveryFailure) {
        LogSink.report(failure);
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(failure.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_failures() {
        let sink = MemorySink::new();
        let failure = DeliveryFailure {
            entry_id: Uuid::new_v4(),
            source_message_id: MessageId::new("9"),
            channel: ChannelId::from("-200"),
            cause: FailureCause::rejected(&PlatformError::PermissionDenied),
        };
        sink.report(&failure);
        assert_eq!(sink.failures(), vec![failure]);
    }

    #[test]
    fn cause_serializes_with_kind_tag() {
        let cause = FailureCause::RetriesExhausted {
            retries: 4,
            last_error: "Rate limited".into(),
        };
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json["kind"], "retries_exhausted");
        assert_eq!(json["retries"], 4);
    }
}
