//! Channel relay — watches source channels and forwards matching posts to
//! target channels under per-channel rate limits.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod platform;
pub mod relay;
