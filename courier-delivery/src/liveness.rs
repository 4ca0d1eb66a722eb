//! Periodic reachability probe for the SMTP server.
//!
//! [`LivenessMonitor`] runs its own task, opening a fresh connection through
//! [`SenderHealth::test_connection`] on every cycle. Snapshots never wait on a
//! probe: they return the last recorded outcome.
//!
//! A panic inside the probe loop stops the monitor for good; from then on every
//! snapshot reports [`ProbeError::MonitorFailed`].

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_common::tracing;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ProbeError, panic_message};

/// What the monitor needs from a sender.
#[async_trait]
pub trait SenderHealth: Send + Sync {
    /// # Errors
    ///
    /// Returns why the server could not be reached.
    async fn test_connection(&self, cancel: &CancellationToken) -> Result<(), ProbeError>;

    fn failed_count(&self) -> u64;

    fn reset_count(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessOptions {
    /// Reset the sender's failure counter after every probe.
    ///
    /// Default: true
    #[serde(default = "defaults::reset_count_on_report")]
    pub reset_count_on_report: bool,

    /// Wait after a successful probe.
    ///
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "defaults::healthy_interval_secs")]
    pub healthy_interval_secs: u64,

    /// Wait after a failed probe.
    ///
    /// Default: 120 seconds (2 minutes)
    #[serde(default = "defaults::unhealthy_interval_secs")]
    pub unhealthy_interval_secs: u64,
}

impl Default for LivenessOptions {
    fn default() -> Self {
        Self {
            reset_count_on_report: defaults::reset_count_on_report(),
            healthy_interval_secs: defaults::healthy_interval_secs(),
            unhealthy_interval_secs: defaults::unhealthy_interval_secs(),
        }
    }
}

impl LivenessOptions {
    #[must_use]
    pub const fn healthy_interval(&self) -> Duration {
        Duration::from_secs(self.healthy_interval_secs)
    }

    #[must_use]
    pub const fn unhealthy_interval(&self) -> Duration {
        Duration::from_secs(self.unhealthy_interval_secs)
    }
}

mod defaults {
    pub const fn reset_count_on_report() -> bool {
        true
    }

    pub const fn healthy_interval_secs() -> u64 {
        600
    }

    pub const fn unhealthy_interval_secs() -> u64 {
        120
    }
}

/// Point-in-time liveness report.
#[derive(Debug, Clone)]
pub struct LivenessSnapshot {
    /// Why the last probe failed; `None` when it succeeded.
    pub last_error: Option<Arc<ProbeError>>,
    /// Unsuccessful sends since the counter was last reset.
    pub failed_count: u64,
    pub next_probe_in_secs: u64,
}

impl LivenessSnapshot {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }
}

#[derive(Debug)]
struct State {
    last_error: Option<Arc<ProbeError>>,
    next_probe: Instant,
}

pub struct LivenessMonitor {
    health: Arc<dyn SenderHealth>,
    state: Arc<RwLock<State>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LivenessMonitor {
    /// Starts probing immediately.
    #[must_use]
    pub fn spawn(health: Arc<dyn SenderHealth>, options: LivenessOptions) -> Self {
        let state = Arc::new(RwLock::new(State {
            last_error: None,
            next_probe: Instant::now(),
        }));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            Arc::clone(&health),
            options,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self {
            health,
            state,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> LivenessSnapshot {
        let state = self.state.read();

        LivenessSnapshot {
            last_error: state.last_error.clone(),
            failed_count: self.health.failed_count(),
            next_probe_in_secs: state
                .next_probe
                .saturating_duration_since(Instant::now())
                .as_secs(),
        }
    }

    /// Stops the probe loop and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let Some(task) = self.task.lock().take() else {
            return;
        };
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Liveness monitor terminated abnormally");
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("state", &*self.state.read())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn supervise(
    health: Arc<dyn SenderHealth>,
    options: LivenessOptions,
    state: Arc<RwLock<State>>,
    cancel: CancellationToken,
) {
    tracing::info!("Liveness monitor starting");

    let probe_loop = AssertUnwindSafe(probe_loop(health.as_ref(), options, &state, &cancel));
    match probe_loop.catch_unwind().await {
        Ok(()) => tracing::info!("Liveness monitor stopped"),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(panic = %message, "Liveness monitor went down, reporting unhealthy from now on");

            let mut state = state.write();
            state.last_error = Some(Arc::new(ProbeError::MonitorFailed(message)));
            state.next_probe = Instant::now();
        }
    }
}

async fn probe_loop(
    health: &dyn SenderHealth,
    options: LivenessOptions,
    state: &RwLock<State>,
    cancel: &CancellationToken,
) {
    let mut previously_failed = false;

    loop {
        let result = health.test_connection(cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        let interval = match &result {
            Ok(()) => {
                if previously_failed {
                    tracing::info!("SMTP server is reachable again");
                } else {
                    tracing::debug!("SMTP server is reachable");
                }
                options.healthy_interval()
            }
            Err(e) => {
                let retry_in = options.unhealthy_interval();
                if previously_failed {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = retry_in.as_secs(),
                        "SMTP server is still not reachable"
                    );
                } else {
                    tracing::error!(error = %e, "Could not connect to the SMTP server");
                }
                retry_in
            }
        };
        previously_failed = result.is_err();

        {
            let mut state = state.write();
            state.last_error = result.err().map(Arc::new);
            state.next_probe = Instant::now() + interval;
        }

        if options.reset_count_on_report {
            health.reset_count();
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
