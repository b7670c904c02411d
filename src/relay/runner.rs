//! Relay runner — wires intake, admission, queue and delivery lanes.
//!
//! ```text
//! Platform::start() ──► pump ──► bounded inbound channel ──► intake
//!                                                              │ source check, dedup,
//!                                                              │ AdmissionFilter::evaluate
//!                                                              ▼
//!                                                        DispatchQueue
//!                                                              │
//!                                                         Dispatcher
//!                                                    ┌─────────┼─────────┐
//!                                                  lane A    lane B    lane C
//! ```
//!
//! Individual message failures never stop the pipeline. Only
//! [`RelayHandle::shutdown`] does.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, SenderConfig};
use crate::error::{ConfigError, PipelineError, QueueError, Result};
use crate::pipeline::dedup::SeenWindow;
use crate::pipeline::filter::AdmissionFilter;
use crate::pipeline::types::{Admission, ChannelId, DropReason, RawMessage};
use crate::platform::{MessageStream, Platform};
use crate::relay::limiter::BackoffPolicy;
use crate::relay::queue::DispatchQueue;
use crate::relay::sender::{ChannelLane, Dispatcher};
use crate::relay::sink::{FailureSink, LogSink};

// ── Counters ────────────────────────────────────────────────────────

/// Pipeline counters, updated lock-free from every stage.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub received: AtomicU64,
    pub ignored_source: AtomicU64,
    pub duplicates: AtomicU64,
    pub dropped_no_link: AtomicU64,
    pub dropped_excluded: AtomicU64,
    pub dropped_empty: AtomicU64,
    pub dropped_media: AtomicU64,
    pub queue_full: AtomicU64,
    pub enqueued: AtomicU64,
    /// Per-target outcomes.
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub ignored_source: u64,
    pub duplicates: u64,
    pub dropped_no_link: u64,
    pub dropped_excluded: u64,
    pub dropped_empty: u64,
    pub dropped_media: u64,
    pub queue_full: u64,
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            ignored_source: load(&self.ignored_source),
            duplicates: load(&self.duplicates),
            dropped_no_link: load(&self.dropped_no_link),
            dropped_excluded: load(&self.dropped_excluded),
            dropped_empty: load(&self.dropped_empty),
            dropped_media: load(&self.dropped_media),
            queue_full: load(&self.queue_full),
            enqueued: load(&self.enqueued),
            delivered: load(&self.delivered),
            failed: load(&self.failed),
            abandoned: load(&self.abandoned),
        }
    }

    fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::NoLinkPattern => &self.dropped_no_link,
            DropReason::ExcludedKeyword => &self.dropped_excluded,
            DropReason::EmptyAfterSanitize => &self.dropped_empty,
            DropReason::MediaPresent => &self.dropped_media,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// A configured, not yet running relay.
pub struct Relay {
    platform: Arc<dyn Platform>,
    filter: Arc<AdmissionFilter>,
    sources: BTreeSet<ChannelId>,
    targets: BTreeSet<ChannelId>,
    sender: SenderConfig,
    backoff: Option<BackoffPolicy>,
    max_queue: usize,
    inbound_buffer: usize,
    dedup_window: usize,
    sink: Arc<dyn FailureSink>,
}

impl Relay {
    /// Build a relay from configuration. Compiles all filter patterns.
    pub fn from_config(
        config: &RelayConfig,
        platform: Arc<dyn Platform>,
    ) -> std::result::Result<Self, ConfigError> {
        config.sender.validate()?;
        let filter = AdmissionFilter::from_config(&config.filter, config.target_channels.clone())?;
        Ok(Self {
            platform,
            filter: Arc::new(filter),
            sources: config.source_channels.clone(),
            targets: config.target_channels.clone(),
            sender: config.sender.clone(),
            backoff: None,
            max_queue: config.queue.max_queue,
            inbound_buffer: config.queue.inbound_buffer,
            dedup_window: config.queue.dedup_window,
            sink: Arc::new(LogSink),
        })
    }

    /// Report terminal failures somewhere other than the log.
    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the backoff policy derived from the sender config.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Subscribe to the sources and spawn all relay tasks.
    pub async fn start(self) -> Result<RelayHandle> {
        let stream = self
            .platform
            .start(&self.sources)
            .await
            .map_err(|e| PipelineError::StartupFailed(e.to_string()))?;
        Ok(self.start_with_stream(stream))
    }

    /// Spawn all relay tasks over an already-open inbound stream.
    pub fn start_with_stream(self, stream: MessageStream) -> RelayHandle {
        let stats = Arc::new(RelayStats::default());
        let queue = Arc::new(DispatchQueue::new(self.max_queue));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // One lane (and one token bucket) per target channel.
        let mut lanes = HashMap::with_capacity(self.targets.len());
        let mut lane_handles = Vec::with_capacity(self.targets.len());
        for channel in &self.targets {
            let mut lane = ChannelLane::new(
                channel.clone(),
                Arc::clone(&self.platform),
                &self.sender,
                Arc::clone(&self.sink),
                shutdown_rx.clone(),
            );
            if let Some(backoff) = self.backoff {
                lane = lane.with_backoff(backoff);
            }
            let (tx, handle) = lane.spawn(self.max_queue);
            lanes.insert(channel.clone(), tx);
            lane_handles.push(handle);
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&queue),
            lanes,
            Arc::clone(&self.sink),
            Arc::clone(&stats),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run());

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_buffer);
        let pump_handle = tokio::spawn(pump(stream, inbound_tx));

        let intake = Intake {
            filter: Arc::clone(&self.filter),
            queue: Arc::clone(&queue),
            sources: self.sources.clone(),
            seen: SeenWindow::new(self.dedup_window),
            stats: Arc::clone(&stats),
        };
        let intake_handle = tokio::spawn(intake.run(inbound_rx, shutdown_rx));

        info!(
            platform = self.platform.name(),
            sources = self.sources.len(),
            targets = self.targets.len(),
            max_queue = self.max_queue,
            "Relay started"
        );

        RelayHandle {
            platform: self.platform,
            queue,
            stats,
            shutdown_tx,
            pump: pump_handle,
            intake: Some(intake_handle),
            dispatcher: dispatcher_handle,
            lanes: lane_handles,
        }
    }
}

/// Move messages from the platform stream into the bounded inbound channel.
async fn pump(mut stream: MessageStream, tx: mpsc::Sender<RawMessage>) {
    while let Some(message) = stream.next().await {
        if tx.send(message).await.is_err() {
            return;
        }
    }
    debug!("Inbound stream ended");
}

// ── Intake ──────────────────────────────────────────────────────────

struct Intake {
    filter: Arc<AdmissionFilter>,
    queue: Arc<DispatchQueue>,
    sources: BTreeSet<ChannelId>,
    seen: SeenWindow,
    stats: Arc<RelayStats>,
}

impl Intake {
    async fn run(mut self, mut rx: mpsc::Receiver<RawMessage>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = rx.recv() => match next {
                    Some(message) => message,
                    None => {
                        warn!("Inbound stream closed; no further messages will be relayed");
                        return;
                    }
                },
            };
            self.handle(message).await;
        }
        debug!("Intake stopped");
    }

    async fn handle(&mut self, message: RawMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if !self.sources.contains(&message.source_channel) {
            debug!(
                id = %message.id,
                channel = %message.source_channel,
                "Ignoring message from unconfigured channel"
            );
            self.stats.ignored_source.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.seen.first_sighting(&message) {
            debug!(id = %message.id, channel = %message.source_channel, "Duplicate message ignored");
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let payload = match self.filter.evaluate(&message) {
            Admission::Forward(payload) => payload,
            Admission::Drop(reason) => {
                self.stats.record_drop(reason);
                return;
            }
        };

        match self.queue.enqueue(payload).await {
            Ok(entry_id) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                info!(
                    id = %message.id,
                    channel = %message.source_channel,
                    entry_id = %entry_id,
                    "Message admitted for forwarding"
                );
            }
            Err(QueueError::Full { capacity }) => {
                self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = %message.id,
                    channel = %message.source_channel,
                    capacity,
                    "Dispatch queue full, message dropped"
                );
            }
            Err(QueueError::Closed) => {
                warn!(id = %message.id, "Dispatch queue closed, message dropped");
            }
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Running relay. Dropping it without calling `shutdown` leaves the tasks
/// running detached.
pub struct RelayHandle {
    platform: Arc<dyn Platform>,
    queue: Arc<DispatchQueue>,
    stats: Arc<RelayStats>,
    shutdown_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
    intake: Option<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
    lanes: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    /// Entries admitted and not yet finished on every target.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Resolve when the inbound side stops (stream ended or shutdown).
    pub async fn inbound_closed(&mut self) {
        if let Some(intake) = self.intake.as_mut() {
            let _ = intake.await;
            self.intake = None;
        }
    }

    /// Stop the relay.
    ///
    /// Intake stops, entries still queued are dropped with a warning,
    /// in-flight sends finish, and nothing is retried afterwards.
    pub async fn shutdown(self) -> StatsSnapshot {
        info!("Relay shutting down");
        let _ = self.shutdown_tx.send(true);

        self.pump.abort();
        if let Some(intake) = self.intake {
            let _ = intake.await;
        }

        let undelivered = self.queue.close().await;
        for entry in &undelivered {
            warn!(
                entry_id = %entry.id,
                source_id = %entry.payload.source_message_id,
                targets = entry.payload.target_channels.len(),
                "Dropping undelivered entry at shutdown"
            );
            self.stats
                .abandoned
                .fetch_add(entry.payload.target_channels.len() as u64, Ordering::Relaxed);
        }

        let _ = self.dispatcher.await;
        for lane in self.lanes {
            let _ = lane.await;
        }

        if let Err(e) = self.platform.shutdown().await {
            warn!(error = %e, "Platform shutdown failed");
        }

        let stats = self.stats.snapshot();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "Relay stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::config::{FilterConfig, QueueConfig};
    use crate::error::{Error, PlatformError};
    use crate::pipeline::types::MessageId;

    struct Offline;

    #[async_trait]
    impl Platform for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn start(&self, _sources: &BTreeSet<ChannelId>) -> std::result::Result<MessageStream, PlatformError> {
            Err(PlatformError::PermissionDenied)
        }

        async fn send(&self, _channel: &ChannelId, _text: &str) -> std::result::Result<MessageId, PlatformError> {
            Err(PlatformError::PermissionDenied)
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            api_id: 1,
            api_hash: SecretString::from("hash".to_string()),
            bot_token: SecretString::from("token".to_string()),
            source_channels: [ChannelId::from("-100")].into(),
            target_channels: [ChannelId::from("-200")].into(),
            filter: FilterConfig::default(),
            queue: QueueConfig::default(),
            sender: SenderConfig::default(),
        }
    }

    #[test]
    fn drops_are_counted_by_reason() {
        let stats = RelayStats::default();
        stats.record_drop(DropReason::NoLinkPattern);
        stats.record_drop(DropReason::NoLinkPattern);
        stats.record_drop(DropReason::MediaPresent);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped_no_link, 2);
        assert_eq!(snapshot.dropped_media, 1);
        assert_eq!(snapshot.dropped_excluded, 0);
    }

    #[test]
    fn invalid_pattern_fails_construction() {
        let mut config = config();
        config.filter.excluded_keywords = vec!["re:(unclosed".into()];
        assert!(matches!(
            Relay::from_config(&config, Arc::new(Offline)),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn invalid_sender_config_fails_construction() {
        let mut config = config();
        config.sender.rate_per_sec = 0.0;
        assert!(matches!(
            Relay::from_config(&config, Arc::new(Offline)),
            Err(ConfigError::InvalidValue { key, .. }) if key == "RELAY_SEND_RATE"
        ));
    }

    #[tokio::test]
    async fn start_reports_subscription_failure() {
        let relay = Relay::from_config(&config(), Arc::new(Offline)).unwrap();
        match relay.start().await {
            Err(Error::Pipeline(PipelineError::StartupFailed(reason))) => {
                assert_eq!(reason, "Permission denied");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("relay started without a subscription"),
        }
    }

    #[tokio::test]
    async fn ended_stream_closes_inbound_side() {
        let relay = Relay::from_config(&config(), Arc::new(Offline)).unwrap();
        let mut handle = relay.start_with_stream(Box::pin(futures::stream::empty()));
        handle.inbound_closed().await;
        let stats = handle.shutdown().await;
        assert_eq!(stats, StatsSnapshot::default());
    }
}
