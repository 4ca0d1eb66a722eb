//! Bounded intake feeding the delivery workers.
//!
//! The dispatcher holds one semaphore permit per running worker, sized to the
//! connection pool, and only receives the next entry once a permit is free.
//! With a single permit entries are delivered strictly in submission order.

use std::sync::Arc;

use courier_common::tracing::{self, Instrument};
use tokio::{
    sync::{Semaphore, mpsc, oneshot},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    accounting::FailureAccounting, config::Snapshot, message::EmailMessage, pool::Pool,
    prepare::PreparedMail, worker,
};

/// A prepared message waiting for a worker.
pub struct QueueEntry {
    pub prepared: PreparedMail,
    /// Kept for the failure handler.
    pub message: EmailMessage,
    /// Resolved with the final outcome. Dropping it reads as `false`.
    pub completion: Option<oneshot::Sender<bool>>,
    pub cancel: CancellationToken,
    pub snapshot: Arc<Snapshot>,
}

/// Why an entry was not admitted. Returns the entry where it is still owned.
pub(crate) enum AdmitError {
    Full(QueueEntry),
    Closed(QueueEntry),
    Cancelled,
}

impl AdmitError {
    pub(crate) fn into_entry(self) -> Option<QueueEntry> {
        match self {
            Self::Full(entry) | Self::Closed(entry) => Some(entry),
            Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DispatchQueue {
    tx: mpsc::Sender<QueueEntry>,
}

impl DispatchQueue {
    /// Creates the queue and starts its dispatcher. The dispatcher drains the
    /// queue and exits once `shutdown` is cancelled, or once every sender is
    /// gone.
    pub(crate) fn start(
        capacity: usize,
        pool: Arc<Pool>,
        accounting: Arc<FailureAccounting>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dispatcher = tokio::spawn(dispatch(rx, pool, accounting, shutdown));

        (Self { tx }, dispatcher)
    }

    /// Admits `entry` without waiting.
    pub(crate) fn try_admit(&self, entry: QueueEntry) -> Result<(), AdmitError> {
        self.tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(entry) => AdmitError::Full(entry),
            mpsc::error::TrySendError::Closed(entry) => AdmitError::Closed(entry),
        })
    }

    /// Admits `entry`, waiting for space unless `cancel` fires first.
    pub(crate) async fn admit(
        &self,
        entry: QueueEntry,
        cancel: &CancellationToken,
    ) -> Result<(), AdmitError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AdmitError::Cancelled),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(entry);
                    Ok(())
                }
                Err(_) => Err(AdmitError::Closed(entry)),
            },
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<QueueEntry>,
    pool: Arc<Pool>,
    accounting: Arc<FailureAccounting>,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(pool.size()));
    let mut workers = JoinSet::new();
    let mut next_id = 0_u64;
    let mut draining = false;

    tracing::debug!(workers = pool.size(), "Dispatcher started");

    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let entry = tokio::select! {
            biased;
            () = shutdown.cancelled(), if !draining => {
                tracing::debug!(queued = rx.len(), "Dispatcher draining queue");
                rx.close();
                draining = true;
                continue;
            }
            entry = rx.recv() => entry,
        };
        let Some(entry) = entry else {
            break;
        };

        while let Some(result) = workers.try_join_next() {
            log_worker_exit(result);
        }

        next_id += 1;
        let pool = Arc::clone(&pool);
        let accounting = Arc::clone(&accounting);
        workers.spawn(
            async move {
                let _permit = permit;
                worker::run(entry, &pool, &accounting).await;
            }
            .instrument(tracing::debug_span!("worker", worker_id = next_id)),
        );
    }

    while let Some(result) = workers.join_next().await {
        log_worker_exit(result);
    }

    tracing::debug!("Dispatcher stopped");
}

fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Delivery worker terminated abnormally");
    }
}
