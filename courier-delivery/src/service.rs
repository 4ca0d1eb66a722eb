//! The public sending service.

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::tracing;
use courier_smtp::{SmtpTransportFactory, TransportFactory};
use parking_lot::Mutex;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    accounting::FailureAccounting,
    config::{SenderOptions, Snapshot},
    error::{ConfigError, FailureReason, ProbeError, SenderError},
    liveness::SenderHealth,
    message::EmailMessage,
    pool::Pool,
    prepare::{Disposition, PreparedMail, prepare},
    queue::{AdmitError, DispatchQueue, QueueEntry},
    worker::ensure_ready,
};

/// Queues messages and delivers them over a pool of SMTP connections.
///
/// Cloning is cheap; clones share the queue, pool and failure counter. The
/// dispatcher is spawned on construction, so an `EmailSender` must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct EmailSender {
    inner: Arc<Inner>,
}

struct Inner {
    snapshot: watch::Sender<Arc<Snapshot>>,
    queue: DispatchQueue,
    pool: Arc<Pool>,
    accounting: Arc<FailureAccounting>,
    factory: Arc<dyn TransportFactory>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EmailSender {
    /// Creates a sender that talks SMTP.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `options` fail validation.
    pub fn new(options: SenderOptions) -> Result<Self, ConfigError> {
        Self::with_transport(options, Arc::new(SmtpTransportFactory))
    }

    /// Creates a sender whose connections come from `factory`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `options` fail validation.
    pub fn with_transport(
        options: SenderOptions,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ConfigError> {
        let snapshot = Snapshot::new(options)?;
        let pool = Arc::new(Pool::new(
            snapshot.options.max_concurrent_connections,
            factory.as_ref(),
        ));
        let accounting = Arc::new(FailureAccounting::new());
        let shutdown = CancellationToken::new();

        let (queue, dispatcher) = DispatchQueue::start(
            snapshot.options.queue_capacity,
            Arc::clone(&pool),
            Arc::clone(&accounting),
            shutdown.clone(),
        );

        tracing::info!(
            host = %snapshot.endpoint.host,
            port = snapshot.endpoint.port,
            connections = pool.size(),
            queue_capacity = snapshot.options.queue_capacity,
            "Email sender started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                snapshot: watch::Sender::new(Arc::new(snapshot)),
                queue,
                pool,
                accounting,
                factory,
                shutdown,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    /// Sends `message` and waits for the final outcome, retries included.
    ///
    /// Returns `Ok(false)` when the message was rejected or could not be
    /// delivered; the failure has then been counted and reported.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Cancelled`] if `cancel` fires before the outcome
    /// is known. A cancelled message is not counted as a failure.
    pub async fn send(
        &self,
        message: EmailMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, SenderError> {
        if cancel.is_cancelled() {
            return Err(SenderError::Cancelled);
        }

        let snapshot = self.snapshot();
        let prepared = match self.preflight(&message, &snapshot).await {
            Ok(prepared) => prepared,
            Err(resolved) => return Ok(resolved),
        };

        let (tx, rx) = oneshot::channel();
        let entry = QueueEntry {
            prepared,
            message,
            completion: Some(tx),
            cancel: cancel.clone(),
            snapshot,
        };

        let admitted = if self.inner.shutdown.is_cancelled() {
            Err(AdmitError::Closed(entry))
        } else {
            self.inner.queue.admit(entry, cancel).await
        };
        if let Err(e) = admitted {
            return self.refuse(e, "The email sender has been shut down").await;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SenderError::Cancelled),
            delivered = rx => Ok(delivered.unwrap_or(false)),
        }
    }

    /// Queues `message` and returns as soon as it is admitted.
    ///
    /// Returns `Ok(false)` if the message was rejected or the queue is full;
    /// the failure has then been counted and reported.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Cancelled`] if `cancel` has already fired.
    pub async fn schedule(
        &self,
        message: EmailMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, SenderError> {
        if cancel.is_cancelled() {
            return Err(SenderError::Cancelled);
        }

        let snapshot = self.snapshot();
        let prepared = match self.preflight(&message, &snapshot).await {
            Ok(prepared) => prepared,
            Err(resolved) => return Ok(resolved),
        };

        let entry = QueueEntry {
            prepared,
            message,
            completion: None,
            cancel: CancellationToken::new(),
            snapshot,
        };

        let admitted = if self.inner.shutdown.is_cancelled() {
            Err(AdmitError::Closed(entry))
        } else {
            self.inner.queue.try_admit(entry)
        };

        match admitted {
            Ok(()) => Ok(true),
            Err(e @ AdmitError::Full(_)) => {
                self.refuse(e, "Delivery queue is full, message was not scheduled")
                    .await
            }
            Err(e) => self.refuse(e, "The email sender has been shut down").await,
        }
    }

    /// Opens a fresh connection, authenticating when required, then closes it.
    ///
    /// The pooled connections and the failure counter are left alone.
    ///
    /// # Errors
    ///
    /// Returns the [`ProbeError`] that stopped the probe.
    pub async fn test_connection(&self, cancel: &CancellationToken) -> Result<(), ProbeError> {
        let snapshot = self.snapshot();
        let mut transport = self.inner.factory.create();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProbeError::Cancelled),
            result = ensure_ready(
                transport.as_mut(),
                &snapshot.endpoint,
                snapshot.credentials.as_ref(),
            ) => result.map_err(ProbeError::from),
        };

        if matches!(result, Err(ProbeError::Cancelled)) {
            transport.abort();
        } else {
            transport.close().await;
        }

        result
    }

    /// Unsuccessful sends since the last reset.
    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.inner.accounting.get()
    }

    pub fn reset_count(&self) {
        self.inner.accounting.reset();
    }

    /// Validates `options` and applies them to messages submitted from now on.
    ///
    /// Pool size and queue capacity are fixed when the sender is created.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the options are invalid or the sender has
    /// been shut down.
    pub fn update_options(&self, options: SenderOptions) -> Result<(), ConfigError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ConfigError::ShutDown);
        }

        let snapshot = Snapshot::new(options)?;
        let current = self.snapshot();
        if snapshot.options.max_concurrent_connections != current.options.max_concurrent_connections
            || snapshot.options.queue_capacity != current.options.queue_capacity
        {
            tracing::warn!(
                "Connection pool size and queue capacity changes apply after a restart"
            );
        }

        self.inner.snapshot.send_replace(Arc::new(snapshot));
        tracing::info!("Email sender options updated");
        Ok(())
    }

    /// The options new messages are prepared under.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.borrow().clone()
    }

    /// Pooled connections currently held by a worker.
    #[must_use]
    pub fn connections_in_use(&self) -> usize {
        self.inner.pool.in_use()
    }

    /// Stops admission, delivers what is already queued, then closes every
    /// pooled connection. Later calls return immediately.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let Some(dispatcher) = self.inner.dispatcher.lock().take() else {
            return;
        };

        tracing::info!("Email sender shutting down");
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Dispatcher terminated abnormally");
        }

        self.inner.pool.close().await;
        tracing::info!("Email sender stopped");
    }

    /// Runs the preparation pipeline. `Err` carries the result for messages
    /// that end here.
    async fn preflight(
        &self,
        message: &EmailMessage,
        snapshot: &Snapshot,
    ) -> Result<PreparedMail, bool> {
        match prepare(message, snapshot) {
            Disposition::Send(prepared) => Ok(prepared),
            Disposition::Succeed => Err(true),
            Disposition::Reject => {
                if snapshot.options.signal_failure_on_invalid_parameters {
                    self.inner
                        .accounting
                        .fail(
                            message,
                            FailureReason::InvalidParameters,
                            snapshot.failure_handler(),
                        )
                        .await;
                }
                Err(false)
            }
        }
    }

    /// Reports an entry that could not be admitted.
    async fn refuse(&self, error: AdmitError, why: &str) -> Result<bool, SenderError> {
        let Some(entry) = error.into_entry() else {
            return Err(SenderError::Cancelled);
        };

        tracing::warn!("{why}");
        self.inner
            .accounting
            .fail(
                &entry.message,
                FailureReason::Unknown,
                entry.snapshot.failure_handler(),
            )
            .await;
        Ok(false)
    }
}

impl std::fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSender")
            .field("pool", &self.inner.pool)
            .field("failed", &self.failed_count())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SenderHealth for EmailSender {
    async fn test_connection(&self, cancel: &CancellationToken) -> Result<(), ProbeError> {
        Self::test_connection(self, cancel).await
    }

    fn failed_count(&self) -> u64 {
        Self::failed_count(self)
    }

    fn reset_count(&self) {
        Self::reset_count(self);
    }
}
