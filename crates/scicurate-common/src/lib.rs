//! scicurate-common: shared errors and HTTP plumbing used across all scicurate crates.

pub mod error;
pub mod rate_limit;
pub mod sandbox;

pub use error::{CurateError, FetchError, Result};
pub use rate_limit::{RateLimitPolicy, RateLimitedClient, ThroughputTier};
