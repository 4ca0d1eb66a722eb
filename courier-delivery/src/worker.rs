//! Delivery of one queued message.
//!
//! A worker holds a pooled connection for the whole retry loop. Each attempt
//! checks the idle session with NOOP, reconnects and authenticates as needed,
//! then sends. Fail-fast reasons and an exhausted backoff end the loop.

use std::panic::AssertUnwindSafe;

use courier_common::tracing;
use courier_smtp::{
    Credentials, Endpoint, Transport,
    client::{ClientError, Mail},
};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::{
    accounting::FailureAccounting,
    config::Snapshot,
    error::{FailureReason, panic_message},
    pool::Pool,
    queue::QueueEntry,
};

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Delivered,
    Failed(FailureReason),
    Cancelled,
}

/// Delivers `entry`, records the outcome and resolves its completion signal.
pub(crate) async fn run(entry: QueueEntry, pool: &Pool, accounting: &FailureAccounting) {
    let QueueEntry {
        prepared,
        message,
        completion,
        cancel,
        snapshot,
    } = entry;

    let outcome = deliver(&prepared.mail, &snapshot, pool, &cancel).await;
    drop(prepared);

    let delivered = match outcome {
        Outcome::Delivered => true,
        Outcome::Failed(reason) => {
            accounting
                .fail(&message, reason, snapshot.failure_handler())
                .await;
            false
        }
        Outcome::Cancelled => {
            tracing::debug!("Delivery cancelled");
            return;
        }
    };

    if let Some(completion) = completion {
        // the caller may have stopped waiting
        let _ = completion.send(delivered);
    }
}

/// The retry loop.
pub(crate) async fn deliver(
    mail: &Mail,
    snapshot: &Snapshot,
    pool: &Pool,
    cancel: &CancellationToken,
) -> Outcome {
    let mut slot = match pool.acquire() {
        Ok(slot) => slot,
        Err(e) => {
            tracing::error!(error = %e, "Failed to acquire a connection slot");
            return Outcome::Failed(FailureReason::Unknown);
        }
    };

    let mut delays = snapshot.retry.delays();
    let mut attempt = 0_u32;

    loop {
        // nothing is in flight yet, so the pooled session stays usable
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = AssertUnwindSafe(try_once(&mut *slot, mail, snapshot)).catch_unwind() => Some(result),
        };

        let reason = match result {
            None => {
                slot.abort();
                return Outcome::Cancelled;
            }
            Some(Ok(Ok(()))) => {
                tracing::info!(
                    attempt,
                    slot = slot.index(),
                    recipients = mail.recipients.len(),
                    "Message delivered"
                );
                return Outcome::Delivered;
            }
            Some(Ok(Err(reason))) => reason,
            Some(Err(payload)) => {
                tracing::error!(
                    attempt,
                    panic = %panic_message(payload.as_ref()),
                    "Delivery attempt panicked"
                );
                slot.abort();
                FailureReason::Unknown
            }
        };

        if reason.is_fail_fast() {
            tracing::warn!(attempt, %reason, "Delivery failed, not retrying");
            return Outcome::Failed(reason);
        }

        let Some(delay) = delays.next() else {
            tracing::warn!(attempts = attempt, %reason, "All retries failed");
            return Outcome::Failed(reason);
        };

        tracing::debug!(attempt, %reason, ?delay, "Delivery failed, retrying");
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Outcome::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// One delivery attempt on `transport`.
async fn try_once(
    transport: &mut dyn Transport,
    mail: &Mail,
    snapshot: &Snapshot,
) -> Result<(), FailureReason> {
    if transport.is_connected() {
        match transport.noop().await {
            Ok(()) => {}
            Err(ClientError::Disposed) => return Err(FailureReason::Disposed),
            Err(e) => {
                tracing::warn!(error = %e, "Idle connection failed NOOP, reconnecting");
                transport.abort();
            }
        }
    }

    if let Err(e) = ensure_ready(transport, &snapshot.endpoint, snapshot.credentials.as_ref()).await {
        tracing::error!(
            error = %e,
            host = %snapshot.endpoint.host,
            port = snapshot.endpoint.port,
            "Could not connect or authenticate to the SMTP server"
        );
        return Err(match e {
            ClientError::Disposed => FailureReason::Disposed,
            _ => FailureReason::Unknown,
        });
    }

    transport.send(mail).await.map_err(|e| {
        let reason = FailureReason::from(&e);
        match reason {
            FailureReason::SendAsDenied => tracing::error!(
                error = %e,
                from = %mail.from,
                sender = ?mail.sender.as_ref().map(ToString::to_string),
                "The account is not allowed to send as the From address"
            ),
            _ if !transport.is_connected() => tracing::warn!(
                error = %e,
                %reason,
                "Connection lost while sending"
            ),
            _ => tracing::warn!(error = %e, %reason, "Failed to send message"),
        }
        reason
    })
}

/// Connects and authenticates `transport` unless it already is.
///
/// # Errors
///
/// Returns the transport error from the failing step.
pub(crate) async fn ensure_ready(
    transport: &mut dyn Transport,
    endpoint: &Endpoint,
    credentials: Option<&Credentials>,
) -> Result<(), ClientError> {
    if !transport.is_connected() {
        transport.connect(endpoint).await?;
    }

    if let Some(credentials) = credentials
        && !transport.is_authenticated()
    {
        transport.authenticate(credentials).await?;
    }

    Ok(())
}
