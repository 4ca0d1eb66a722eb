//! Failure classification and error types for the delivery engine.
//!
//! Transport errors are sorted into [`FailureReason`]s. Fail-fast reasons end
//! the retry loop immediately; everything else is retried with backoff.

use std::{any::Any, fmt};

use courier_smtp::client::ClientError;
use thiserror::Error;

/// Enhanced status the server uses for a recipient it refuses as malformed.
const INVALID_ADDRESS_STATUS: &str = "5.1.3";

/// Enhanced status for a From address the account may not send as.
const SEND_AS_DENIED_STATUS: &str = "5.2.252";

/// Outcome classification reported to the failure handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Delivered.
    None,
    /// Generic or transient failure.
    Unknown,
    /// The transport was torn down mid-operation.
    Disposed,
    /// A send was attempted on a session that was not ready.
    NotConnected,
    /// The server rejected an address.
    InvalidAddress,
    /// The account may not send as the configured From address.
    SendAsDenied,
    /// The message failed local validation and was never sent.
    InvalidParameters,
}

impl FailureReason {
    /// Returns `true` when retrying cannot change the outcome.
    #[must_use]
    pub const fn is_fail_fast(self) -> bool {
        matches!(
            self,
            Self::Disposed | Self::InvalidAddress | Self::SendAsDenied | Self::InvalidParameters
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Unknown => "unknown",
            Self::Disposed => "disposed",
            Self::NotConnected => "not connected",
            Self::InvalidAddress => "invalid address",
            Self::SendAsDenied => "send-as denied",
            Self::InvalidParameters => "invalid parameters",
        };
        f.write_str(name)
    }
}

impl From<&ClientError> for FailureReason {
    fn from(error: &ClientError) -> Self {
        match error {
            ClientError::Disposed => Self::Disposed,
            ClientError::NotConnected | ClientError::NotAuthenticated => Self::NotConnected,
            ClientError::SmtpError { message, .. } => match error.enhanced_status() {
                Some(INVALID_ADDRESS_STATUS) => Self::InvalidAddress,
                Some(SEND_AS_DENIED_STATUS) => Self::SendAsDenied,
                _ if message.contains("SendAsDenied") => Self::SendAsDenied,
                _ => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }
}

/// Errors returned to callers of the submission operations.
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("The operation was cancelled")]
    Cancelled,
}

/// Rejected configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A username is required when authentication is enabled")]
    MissingUsername,

    #[error("A from address is required when {0}")]
    MissingFromAddress(&'static str),

    #[error("Invalid from address: {0}")]
    InvalidFromAddress(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("The sender has been shut down")]
    ShutDown,
}

/// Why a connectivity probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Could not reach the SMTP server: {0}")]
    Transport(#[from] ClientError),

    #[error("The connection test was cancelled")]
    Cancelled,

    #[error("Liveness monitor stopped: {0}")]
    MonitorFailed(String),
}

/// Internal-logic failures of the connection pool.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("No free connection slot among {0}")]
    Exhausted(usize),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
