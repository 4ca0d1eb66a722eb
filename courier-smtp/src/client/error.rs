//! Error types for the SMTP client.

use std::io;

use thiserror::Error;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server replied with a code the current step does not expect.
    #[error("Unexpected SMTP status code: {code} - {message}")]
    UnexpectedResponse { code: u16, message: String },

    /// The server returned an error status code (4xx or 5xx).
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The message could not be assembled.
    #[error("Invalid builder configuration: {0}")]
    BuilderError(String),

    /// Authentication was rejected or no usable mechanism was offered.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// An operation that needs a session was attempted without one.
    #[error("The client is not connected")]
    NotConnected,

    /// A send was attempted before authenticating against a server that requires it.
    #[error("The client is not authenticated")]
    NotAuthenticated,

    /// The transport was closed for good and cannot be reused.
    #[error("The transport has been disposed")]
    Disposed,

    /// A step did not complete within its configured timeout.
    #[error("Timed out during {0}")]
    Timeout(&'static str),

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// The RFC 3463 enhanced status code carried by a server reply, if any
    /// (for example `5.1.3`).
    #[must_use]
    pub fn enhanced_status(&self) -> Option<&str> {
        match self {
            Self::SmtpError { message, .. } | Self::UnexpectedResponse { message, .. } => {
                enhanced_status(message)
            }
            _ => None,
        }
    }

    /// Returns `true` for failures that leave the connection unusable.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::TlsError(_) | Self::Timeout(_)
        )
    }
}

/// Extracts a leading `class.subject.detail` token from reply text.
pub(crate) fn enhanced_status(message: &str) -> Option<&str> {
    let token = message.split_whitespace().next()?;
    let mut parts = token.split('.');

    let class = parts.next()?;
    let subject = parts.next()?;
    let detail = parts.next()?;

    let well_formed = matches!(class, "2" | "4" | "5")
        && !subject.is_empty()
        && subject.len() <= 3
        && subject.bytes().all(|b| b.is_ascii_digit())
        && !detail.is_empty()
        && detail.len() <= 3
        && detail.bytes().all(|b| b.is_ascii_digit())
        && parts.next().is_none();

    well_formed.then_some(token)
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhanced_status_extracted() {
        let error = ClientError::SmtpError {
            code: 550,
            message: "5.1.3 Invalid address".to_string(),
        };
        assert_eq!(error.enhanced_status(), Some("5.1.3"));
    }

    #[test]
    fn test_enhanced_status_three_digit_detail() {
        assert_eq!(
            enhanced_status("5.2.252 SendAsDenied; user not allowed"),
            Some("5.2.252")
        );
    }

    #[test]
    fn test_enhanced_status_absent() {
        assert_eq!(enhanced_status("Mailbox unavailable"), None);
        assert_eq!(enhanced_status("1.2.3 not a class"), None);
        assert_eq!(enhanced_status("5.1 short"), None);
        assert_eq!(enhanced_status(""), None);
    }

    #[test]
    fn test_connection_errors() {
        assert!(ClientError::ConnectionClosed.is_connection_error());
        assert!(ClientError::Timeout("DATA").is_connection_error());
        assert!(!ClientError::NotConnected.is_connection_error());
        assert!(
            !ClientError::SmtpError {
                code: 451,
                message: "try later".to_string()
            }
            .is_connection_error()
        );
    }
}
