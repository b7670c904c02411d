//! Dispatch queue, per-channel pacing and delivery.

pub mod limiter;
pub mod queue;
pub mod runner;
pub mod sender;
pub mod sink;

pub use runner::{Relay, RelayHandle, RelayStats, StatsSnapshot};
pub use sink::{DeliveryFailure, FailureCause, FailureSink, LogSink, MemorySink};
