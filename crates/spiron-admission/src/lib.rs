//! Admission pipeline for inbound broadcasts.
//!
//! Every broadcast passes four gates in a fixed order and stops at the first
//! one that refuses it:
//!
//! 1. [`PeerAllowlist`]: is the sender permitted at all?
//! 2. [`RateLimiter`]: token bucket per sender
//! 3. [`BroadcastValidator`]: id format, vector shape, energy range
//! 4. [`DuplicateDetector`]: has this id been seen inside the expiry window?
//!
//! Only a broadcast that clears all four reaches the dominance engine.
//! Refusals come back as a typed [`Rejection`], never as an error.
//!
//! The rate and dedup tables are sharded maps, so concurrent handlers only
//! contend when they touch the same key.

mod allowlist;
mod dedup;
pub mod error;
mod pipeline;
mod rate_limit;
mod validation;

pub use allowlist::PeerAllowlist;
pub use dedup::DuplicateDetector;
pub use error::{Error, Result};
pub use pipeline::{AdmissionConfig, AdmissionPipeline, Rejection};
pub use rate_limit::RateLimiter;
pub use validation::{BroadcastValidator, ValidationConfig, ValidationError, DEFAULT_ID_PATTERN};
