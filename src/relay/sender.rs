//! Outbound delivery — one paced lane per target channel.
//!
//! Flow:
//! 1. `Dispatcher` dequeues entries in FIFO order and fans each one out
//!    as a [`Delivery`] per target channel
//! 2. Each `ChannelLane` waits for its token bucket, calls `send`, and
//!    walks the delivery state machine:
//!    `Idle -> Sending -> Delivered | Throttled | FatalError`
//! 3. Throttled deliveries back off and retry on the same lane; other lanes
//!    are never held up by it
//!
//! Lanes share nothing mutable with each other. The only cross-lane state is
//! the per-entry [`EntryProgress`] counter, which is atomic. It also holds
//! the entry's queue slot, so the slot frees only once every target has
//! settled and lane backlogs stay within the queue capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SenderConfig;
use crate::error::PlatformError;
use crate::pipeline::types::{ChannelId, MessageId};
use crate::platform::Platform;
use crate::relay::limiter::{BackoffPolicy, TokenBucket};
use crate::relay::queue::{DispatchQueue, QueueEntry};
use crate::relay::runner::RelayStats;
use crate::relay::sink::{DeliveryFailure, FailureCause, FailureSink};

// ── State machine ───────────────────────────────────────────────────

/// State of one delivery to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending,
    Delivered(MessageId),
    /// Retriable failure; wait `delay` before the next attempt.
    Throttled { retries: u32, delay: Duration },
    FatalError(FailureCause),
}

/// Next state after a `send` attempt.
///
/// `retries` is the count consumed before this attempt. A retriable error
/// bumps it; once it exceeds `max_retries` the delivery is fatal.
pub fn next_state(
    result: Result<MessageId, PlatformError>,
    retries: u32,
    max_retries: u32,
    backoff: &BackoffPolicy,
) -> DeliveryState {
    match result {
        Ok(message_id) => DeliveryState::Delivered(message_id),
        Err(error) if error.is_retriable() => {
            let retries = retries.saturating_add(1);
            if retries > max_retries {
                DeliveryState::FatalError(FailureCause::RetriesExhausted {
                    retries,
                    last_error: error.to_string(),
                })
            } else {
                DeliveryState::Throttled {
                    retries,
                    delay: backoff.delay(retries, error.retry_after()),
                }
            }
        }
        Err(error) => DeliveryState::FatalError(FailureCause::rejected(&error)),
    }
}

// ── Fan-out tracking ────────────────────────────────────────────────

/// How a single target of an entry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOutcome {
    Delivered,
    Failed,
    /// Dropped because the relay shut down first.
    Abandoned,
}

/// Remaining-target counter shared by the deliveries of one entry.
#[derive(Debug)]
pub struct EntryProgress {
    entry_id: Uuid,
    source_message_id: MessageId,
    targets: usize,
    remaining: AtomicUsize,
    delivered: AtomicUsize,
    stats: Arc<RelayStats>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl EntryProgress {
    fn new(entry: &QueueEntry, stats: Arc<RelayStats>, slot: Option<OwnedSemaphorePermit>) -> Self {
        let targets = entry.payload.target_channels.len();
        Self {
            entry_id: entry.id,
            source_message_id: entry.payload.source_message_id.clone(),
            targets,
            remaining: AtomicUsize::new(targets),
            delivered: AtomicUsize::new(0),
            stats,
            _slot: slot,
        }
    }

    /// Record the outcome for one target. The last one completes the entry.
    pub fn settle(&self, outcome: TargetOutcome) {
        match outcome {
            TargetOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::AcqRel);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            TargetOutcome::Failed => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
            TargetOutcome::Abandoned => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let delivered = self.delivered.load(Ordering::Acquire);
            info!(
                entry_id = %self.entry_id,
                source_id = %self.source_message_id,
                delivered,
                targets = self.targets,
                "Entry completed"
            );
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

/// One payload bound for one channel.
#[derive(Debug)]
pub struct Delivery {
    pub text: Arc<str>,
    pub retries: u32,
    pub progress: Arc<EntryProgress>,
}

impl Delivery {
    fn failure(&self, channel: &ChannelId, cause: FailureCause) -> DeliveryFailure {
        DeliveryFailure {
            entry_id: self.progress.entry_id,
            source_message_id: self.progress.source_message_id.clone(),
            channel: channel.clone(),
            cause,
        }
    }
}

// ── Lanes ───────────────────────────────────────────────────────────

/// Sequential, paced sender for a single target channel.
pub struct ChannelLane {
    channel: ChannelId,
    platform: Arc<dyn Platform>,
    bucket: TokenBucket,
    backoff: BackoffPolicy,
    max_retries: u32,
    sink: Arc<dyn FailureSink>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelLane {
    pub fn new(
        channel: ChannelId,
        platform: Arc<dyn Platform>,
        config: &SenderConfig,
        sink: Arc<dyn FailureSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            channel,
            platform,
            bucket: TokenBucket::from_config(config),
            backoff: BackoffPolicy::from_config(config),
            max_retries: config.max_retries,
            sink,
            shutdown,
        }
    }

    /// Use a fixed backoff policy (e.g. without jitter).
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run the lane on its own task, fed through the returned sender.
    ///
    /// `buffer` should be at least the dispatch queue capacity: an entry
    /// puts at most one delivery on each lane, so the dispatcher then never
    /// waits on a slow lane.
    pub fn spawn(self, buffer: usize) -> (mpsc::Sender<Delivery>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Delivery>) {
        debug!(channel = %self.channel, "Delivery lane started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                biased;
                _ = until_shutdown(&mut self.shutdown) => break,
                next = rx.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        debug!(channel = %self.channel, "Delivery lane closed");
                        return;
                    }
                },
            };
            self.deliver(delivery).await;
        }

        rx.close();
        let mut dropped = 0usize;
        while let Ok(delivery) = rx.try_recv() {
            self.abandon(&delivery, "queued");
            dropped += 1;
        }
        info!(channel = %self.channel, dropped, "Delivery lane stopped");
    }

    /// Drive one delivery to a terminal state (or shutdown).
    async fn deliver(&mut self, mut delivery: Delivery) {
        let mut state = DeliveryState::Idle;
        loop {
            match state {
                DeliveryState::Idle => {
                    let paced = tokio::select! {
                        biased;
                        _ = until_shutdown(&mut self.shutdown) => false,
                        _ = self.bucket.acquire() => true,
                    };
                    if !paced {
                        self.abandon(&delivery, "pacing");
                        return;
                    }
                    state = DeliveryState::Sending;
                }
                DeliveryState::Sending => {
                    // In-flight sends always run to completion.
                    let result = self.platform.send(&self.channel, &delivery.text).await;
                    state = next_state(result, delivery.retries, self.max_retries, &self.backoff);
                }
                DeliveryState::Delivered(message_id) => {
                    info!(
                        channel = %self.channel,
                        entry_id = %delivery.progress.entry_id,
                        source_id = %delivery.progress.source_message_id,
                        message_id = %message_id,
                        retries = delivery.retries,
                        "Delivered"
                    );
                    delivery.progress.settle(TargetOutcome::Delivered);
                    return;
                }
                DeliveryState::Throttled { retries, delay } => {
                    delivery.retries = retries;
                    warn!(
                        channel = %self.channel,
                        entry_id = %delivery.progress.entry_id,
                        retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Send throttled, backing off before retry"
                    );
                    let waited = tokio::select! {
                        biased;
                        _ = until_shutdown(&mut self.shutdown) => false,
                        _ = tokio::time::sleep(delay) => true,
                    };
                    if !waited {
                        self.abandon(&delivery, "backoff");
                        return;
                    }
                    state = DeliveryState::Idle;
                }
                DeliveryState::FatalError(cause) => {
                    self.sink.report(&delivery.failure(&self.channel, cause));
                    delivery.progress.settle(TargetOutcome::Failed);
                    return;
                }
            }
        }
    }

    fn abandon(&self, delivery: &Delivery, stage: &str) {
        warn!(
            channel = %self.channel,
            entry_id = %delivery.progress.entry_id,
            source_id = %delivery.progress.source_message_id,
            stage,
            "Dropping undelivered entry at shutdown"
        );
        delivery.progress.settle(TargetOutcome::Abandoned);
    }
}

/// Resolve once shutdown is signalled. Never resolves if the signal's
/// sender is gone without having signalled.
async fn until_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

/// Drains the dispatch queue into per-channel lanes.
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
    lanes: HashMap<ChannelId, mpsc::Sender<Delivery>>,
    sink: Arc<dyn FailureSink>,
    stats: Arc<RelayStats>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DispatchQueue>,
        lanes: HashMap<ChannelId, mpsc::Sender<Delivery>>,
        sink: Arc<dyn FailureSink>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            queue,
            lanes,
            sink,
            stats,
        }
    }

    /// Run until the queue is closed.
    pub async fn run(self) {
        while let Some(entry) = self.queue.dequeue().await {
            self.dispatch(entry).await;
        }
        debug!("Dispatcher stopped");
    }

    async fn dispatch(&self, mut entry: QueueEntry) {
        if entry.payload.target_channels.is_empty() {
            warn!(entry_id = %entry.id, "Entry has no target channels");
            return;
        }

        let slot = entry.take_slot();
        let progress = Arc::new(EntryProgress::new(&entry, Arc::clone(&self.stats), slot));
        let text: Arc<str> = Arc::from(entry.payload.text.as_str());

        for channel in &entry.payload.target_channels {
            let delivery = Delivery {
                text: Arc::clone(&text),
                retries: 0,
                progress: Arc::clone(&progress),
            };

            let Some(lane) = self.lanes.get(channel) else {
                self.sink
                    .report(&delivery.failure(channel, FailureCause::NoLane));
                progress.settle(TargetOutcome::Failed);
                continue;
            };

            if let Err(mpsc::error::SendError(delivery)) = lane.send(delivery).await {
                // Lane already stopped: only happens during shutdown.
                warn!(
                    channel = %channel,
                    entry_id = %entry.id,
                    "Dropping undelivered entry at shutdown"
                );
                delivery.progress.settle(TargetOutcome::Abandoned);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::types::OutboundPayload;
    use crate::platform::MessageStream;
    use crate::relay::sink::MemorySink;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)).without_jitter()
    }

    #[test]
    fn success_is_delivered() {
        let state = next_state(Ok(MessageId::new("5")), 0, 3, &policy());
        assert_eq!(state, DeliveryState::Delivered(MessageId::new("5")));
    }

    #[test]
    fn throttle_increments_retries_and_honors_retry_after() {
        let state = next_state(
            Err(PlatformError::Throttled {
                retry_after: Duration::from_secs(30),
            }),
            0,
            3,
            &policy(),
        );
        assert_eq!(
            state,
            DeliveryState::Throttled {
                retries: 1,
                delay: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn transient_backs_off_exponentially() {
        let state = next_state(Err(PlatformError::Transient("reset".into())), 2, 5, &policy());
        assert_eq!(
            state,
            DeliveryState::Throttled {
                retries: 3,
                delay: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn throttle_past_budget_is_fatal() {
        let throttled = || {
            Err(PlatformError::Throttled {
                retry_after: Duration::from_secs(1),
            })
        };
        assert!(matches!(
            next_state(throttled(), 2, 3, &policy()),
            DeliveryState::Throttled { retries: 3, .. }
        ));
        assert!(matches!(
            next_state(throttled(), 3, 3, &policy()),
            DeliveryState::FatalError(FailureCause::RetriesExhausted { retries: 4, .. })
        ));
    }

    #[test]
    fn non_retriable_errors_are_fatal_immediately() {
        for error in [PlatformError::NotFound, PlatformError::PermissionDenied] {
            assert!(matches!(
                next_state(Err(error), 0, 3, &policy()),
                DeliveryState::FatalError(FailureCause::Rejected { .. })
            ));
        }
    }

    /// Platform that replays scripted results and records attempt times.
    struct Scripted {
        results: Mutex<Vec<Result<MessageId, PlatformError>>>,
        attempts: Mutex<Vec<tokio::time::Instant>>,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<MessageId, PlatformError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<tokio::time::Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Platform for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn start(
            &self,
            _sources: &BTreeSet<ChannelId>,
        ) -> Result<MessageStream, PlatformError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send(&self, _channel: &ChannelId, _text: &str) -> Result<MessageId, PlatformError> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(MessageId::new("ok")))
        }
    }

    fn entry(targets: &[&str]) -> QueueEntry {
        QueueEntry::new(OutboundPayload {
            source_message_id: MessageId::new("src-1"),
            source_channel: ChannelId::from("-100"),
            text: "hello".into(),
            target_channels: targets.iter().map(|t| ChannelId::from(*t)).collect(),
        })
    }

    fn delivery_for(entry: &QueueEntry, stats: &Arc<RelayStats>) -> (Delivery, Arc<EntryProgress>) {
        let progress = Arc::new(EntryProgress::new(entry, Arc::clone(stats), None));
        let delivery = Delivery {
            text: Arc::from(entry.payload.text.as_str()),
            retries: 0,
            progress: Arc::clone(&progress),
        };
        (delivery, progress)
    }

    #[tokio::test(start_paused = true)]
    async fn lane_retries_after_throttle_then_delivers() {
        let platform = Arc::new(Scripted::new(vec![Err(PlatformError::Throttled {
            retry_after: Duration::from_secs(30),
        })]));
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(RelayStats::default());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let lane = ChannelLane::new(
            ChannelId::from("-200"),
            platform.clone(),
            &SenderConfig::default(),
            sink.clone(),
            stop_rx,
        )
        .with_backoff(policy());
        let (tx, handle) = lane.spawn(4);

        let entry = entry(&["-200"]);
        let (delivery, progress) = delivery_for(&entry, &stats);
        tx.send(delivery).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let attempts = platform.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(30));
        assert_eq!(progress.remaining(), 0);
        assert_eq!(stats.snapshot().delivered, 1);
        assert!(sink.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lane_gives_up_after_max_retries() {
        let throttle = || {
            Err(PlatformError::Throttled {
                retry_after: Duration::from_secs(1),
            })
        };
        let platform = Arc::new(Scripted::new(vec![throttle(), throttle(), throttle()]));
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(RelayStats::default());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = SenderConfig {
            max_retries: 2,
            ..SenderConfig::default()
        };

        let lane = ChannelLane::new(
            ChannelId::from("-200"),
            platform.clone(),
            &config,
            sink.clone(),
            stop_rx,
        )
        .with_backoff(policy());
        let (tx, handle) = lane.spawn(4);

        let entry = entry(&["-200"]);
        let (delivery, _progress) = delivery_for(&entry, &stats);
        tx.send(delivery).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // Initial attempt plus two retries, then no further attempts.
        assert_eq!(platform.attempts().len(), 3);
        let failures = sink.failures();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].cause,
            FailureCause::RetriesExhausted { retries: 3, .. }
        ));
        assert_eq!(failures[0].entry_id, entry.id);
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_backoff_without_retrying() {
        let platform = Arc::new(Scripted::new(vec![Err(PlatformError::Throttled {
            retry_after: Duration::from_secs(600),
        })]));
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(RelayStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let lane = ChannelLane::new(
            ChannelId::from("-200"),
            platform.clone(),
            &SenderConfig::default(),
            sink.clone(),
            stop_rx,
        )
        .with_backoff(policy());
        let (tx, handle) = lane.spawn(4);

        let entry = entry(&["-200"]);
        let (delivery, progress) = delivery_for(&entry, &stats);
        tx.send(delivery).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(platform.attempts().len(), 1);
        assert_eq!(progress.remaining(), 0);
        assert_eq!(stats.snapshot().abandoned, 1);
        assert!(sink.failures().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_reports_missing_lane() {
        let queue = Arc::new(DispatchQueue::new(4));
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(RelayStats::default());
        let dispatcher = Dispatcher::new(Arc::clone(&queue), HashMap::new(), sink.clone(), stats.clone());

        dispatcher.dispatch(entry(&["-999"])).await;

        let failures = sink.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].cause, FailureCause::NoLane);
        assert_eq!(stats.snapshot().failed, 1);
    }
}
