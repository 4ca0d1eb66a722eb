//! Outbound mail delivery engine.
//!
//! Messages submitted to an [`EmailSender`] are validated and rendered by the
//! preparation pipeline, queued under backpressure, and delivered over a fixed
//! pool of transport connections with jittered retries. Failures are counted
//! and reported to an optional [`FailureHandler`]. A [`LivenessMonitor`] probes
//! server reachability on its own schedule.
//!
//! ```no_run
//! use courier_delivery::{EmailMessage, EmailSender, SenderOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sender = EmailSender::new(SenderOptions {
//!     host: "smtp.example.com".to_string(),
//!     username: Some("robot@example.com".to_string()),
//!     password: Some("secret".to_string()),
//!     ..SenderOptions::default()
//! })?;
//!
//! let message = EmailMessage::new(["user@example.com"], "Hello", "<p>Hi there</p>");
//! let delivered = sender.send(message, &CancellationToken::new()).await?;
//!
//! sender.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod accounting;
pub mod config;
pub mod error;
pub mod liveness;
pub mod message;
pub mod policy;
pub mod pool;
pub mod prepare;
mod queue;
mod service;
mod worker;

pub use accounting::{FailureAccounting, FailureHandler};
pub use config::{FailureCallback, SenderOptions, Snapshot};
pub use error::{ConfigError, FailureReason, PoolError, ProbeError, SenderError};
pub use liveness::{LivenessMonitor, LivenessOptions, LivenessSnapshot, SenderHealth};
pub use message::{EmailAttachment, EmailMessage};
pub use policy::RetryPolicy;
pub use prepare::{Disposition, PreparedMail};
pub use queue::QueueEntry;
pub use service::EmailSender;

pub use courier_smtp::TlsMode;
