//! Shared plumbing for the courier crates: logging setup and the logging
//! macros used to tag events by direction.

pub mod logging;

pub use tracing;
