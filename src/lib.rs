//! Climate Extract Library
//!
//! Pulls daily climatological records for weather stations from a
//! rate-limited public API over arbitrarily long date ranges.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`extract`] - Rate limiting, pooled transport, retries, range batching and record parsing
//! - [`station`] - Station inventory and nearest-station resolution

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod extract;
pub mod station;
mod user_agent;

// Re-export commonly used types
pub use extract::{
    ClientConfig, ClimateClient, DailyRecord, FailureKind, FetchError, PoolConfig, PoolStats,
    RateLimitConfig, RateLimiterStats, RetryPolicy,
};
pub use station::{Station, StationId, StationInventory, StationResolver};
