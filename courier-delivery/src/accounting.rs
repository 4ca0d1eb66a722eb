//! Failure accounting: a counter of unsuccessful sends and the user's
//! failure handler.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use courier_common::tracing;
use futures_util::FutureExt;

use crate::{
    error::{FailureReason, panic_message},
    message::EmailMessage,
};

/// Notified once for every message that ends in failure.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    async fn on_failure(&self, message: &EmailMessage, reason: FailureReason) -> anyhow::Result<()>;
}

/// Unsuccessful sends since the last reset.
#[derive(Debug, Default)]
pub struct FailureAccounting {
    failed: AtomicU64,
}

impl FailureAccounting {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failed: AtomicU64::new(0),
        }
    }

    /// Returns the updated count.
    pub fn increment(&self) -> u64 {
        self.failed.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.failed.store(0, Ordering::Release);
    }

    /// Counts a terminal failure and hands it to `handler`.
    ///
    /// The handler runs to completion before this returns; an error or panic
    /// inside it is logged and swallowed.
    pub async fn fail(
        &self,
        message: &EmailMessage,
        reason: FailureReason,
        handler: Option<&Arc<dyn FailureHandler>>,
    ) {
        let failed = self.increment();
        tracing::warn!(%reason, failed, recipients = ?message.recipients, "Message was not delivered");

        let Some(handler) = handler else {
            return;
        };

        match AssertUnwindSafe(handler.on_failure(message, reason))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, %reason, "Failure handler returned an error");
            }
            Err(payload) => {
                tracing::error!(
                    panic = %panic_message(payload.as_ref()),
                    %reason,
                    "Failure handler panicked"
                );
            }
        }
    }
}
