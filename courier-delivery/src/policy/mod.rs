//! Delivery policies.
//!
//! - [`RetryPolicy`]: how often and how long to wait between attempts

pub mod retry;

pub use retry::{Backoff, RetryPolicy};
