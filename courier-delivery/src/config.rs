//! Sender configuration and the immutable snapshot built from it.

use std::{
    fmt,
    sync::{Arc, LazyLock},
    time::Duration,
};

use ahash::AHashSet;
use courier_smtp::{
    Credentials, Endpoint, TlsMode,
    address::{Compliance, ParserOptions},
    client::SmtpTimeouts,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{accounting::FailureHandler, error::ConfigError, policy::RetryPolicy};

/// Upper bound on pooled connections; every slot owns a transport up front.
pub const MAX_CONCURRENT_CONNECTIONS: usize = 1024;

/// Upper bound on queued messages, the largest capacity a bounded channel
/// accepts.
pub const MAX_QUEUE_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// The HTML5 `input[type=email]` grammar.
#[allow(clippy::expect_used)]
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email pattern is valid")
});

/// Returns `true` if `value` is a plain `local@domain` address.
#[must_use]
pub fn is_email_address(value: &str) -> bool {
    EMAIL.is_match(value)
}

/// A programmatic failure handler, shared between snapshots.
#[derive(Clone)]
pub struct FailureCallback(pub Arc<dyn FailureHandler>);

impl FailureCallback {
    pub fn new(handler: impl FailureHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }
}

impl fmt::Debug for FailureCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureCallback")
    }
}

/// Settings for an [`EmailSender`](crate::EmailSender).
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderOptions {
    /// SMTP submission host
    pub host: String,

    /// Default: 587
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Authenticate after connecting. Default: true
    #[serde(default = "defaults::enabled")]
    pub requires_authentication: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Address used for the From header. Mandatory unless the username is
    /// itself an email address.
    #[serde(default)]
    pub from_address: Option<String>,

    /// Retries after the first attempt. Default: 3
    #[serde(default = "defaults::retry_count")]
    pub retry_count: u32,

    /// Median delay before the first retry, in milliseconds. Default: 2000
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Pool size and worker concurrency. `1` delivers in submission order.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_concurrent_connections")]
    pub max_concurrent_connections: usize,

    /// Messages buffered ahead of the workers. Default: 10000
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub tls: TlsMode,

    /// Skip server certificate validation.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub treat_empty_recipients_as_success: bool,

    /// Strip numeric tags such as `+123` from recipient local parts.
    #[serde(default)]
    pub enable_temp_mail_routing: bool,

    /// When non-empty, only these recipients are delivered to.
    #[serde(default)]
    pub whitelist: Vec<String>,

    #[serde(default = "defaults::enabled")]
    pub allow_unquoted_commas: bool,

    #[serde(default = "defaults::enabled")]
    pub allow_addresses_without_domain: bool,

    #[serde(default)]
    pub use_strict_address_parser: bool,

    /// Count and report messages rejected before sending.
    #[serde(default)]
    pub signal_failure_on_invalid_parameters: bool,

    /// Reject messages whose inline placeholders are missing from the body.
    ///
    /// Default: true
    #[serde(default = "defaults::enabled")]
    pub verify_inline_attachments: bool,

    /// Default: "localhost"
    #[serde(default = "defaults::helo_domain")]
    pub helo_domain: String,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(skip)]
    pub failure_handler: Option<FailureCallback>,
}

mod defaults {
    pub const fn port() -> u16 {
        587
    }

    pub const fn enabled() -> bool {
        true
    }

    pub const fn retry_count() -> u32 {
        3
    }

    pub const fn retry_delay_ms() -> u64 {
        2000
    }

    pub const fn max_concurrent_connections() -> usize {
        3
    }

    pub const fn queue_capacity() -> usize {
        10_000
    }

    pub fn helo_domain() -> String {
        "localhost".to_string()
    }
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: defaults::port(),
            requires_authentication: defaults::enabled(),
            username: None,
            password: None,
            from_address: None,
            retry_count: defaults::retry_count(),
            retry_delay_ms: defaults::retry_delay_ms(),
            max_concurrent_connections: defaults::max_concurrent_connections(),
            queue_capacity: defaults::queue_capacity(),
            tls: TlsMode::default(),
            accept_invalid_certs: false,
            treat_empty_recipients_as_success: false,
            enable_temp_mail_routing: false,
            whitelist: Vec::new(),
            allow_unquoted_commas: defaults::enabled(),
            allow_addresses_without_domain: defaults::enabled(),
            use_strict_address_parser: false,
            signal_failure_on_invalid_parameters: false,
            verify_inline_attachments: defaults::enabled(),
            helo_domain: defaults::helo_domain(),
            timeouts: SmtpTimeouts::default(),
            failure_handler: None,
        }
    }
}

impl fmt::Debug for SenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("requires_authentication", &self.requires_authentication)
            .field("username", &self.username)
            .field("from_address", &self.from_address)
            .field("retry_count", &self.retry_count)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("max_concurrent_connections", &self.max_concurrent_connections)
            .field("queue_capacity", &self.queue_capacity)
            .field("tls", &self.tls)
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

impl SenderOptions {
    /// Checks the options are usable for sending.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host",
                reason: "must not be empty",
            });
        }
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_connections",
                reason: "must be at least 1",
            });
        }
        if self.max_concurrent_connections > MAX_CONCURRENT_CONNECTIONS {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_connections",
                reason: "must be at most 1024",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                reason: "must be at least 1",
            });
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                reason: "exceeds the largest supported queue",
            });
        }

        if self.requires_authentication {
            let username = self
                .username
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or(ConfigError::MissingUsername)?;
            if !is_email_address(username) && self.from_address.is_none() {
                return Err(ConfigError::MissingFromAddress(
                    "the username is not an email address",
                ));
            }
        } else if self.from_address.is_none() {
            return Err(ConfigError::MissingFromAddress(
                "authentication is disabled",
            ));
        }

        if let Some(from) = &self.from_address
            && !is_email_address(from)
        {
            return Err(ConfigError::InvalidFromAddress(from.clone()));
        }

        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            helo_domain: self.helo_domain.clone(),
            tls: self.tls,
            accept_invalid_certs: self.accept_invalid_certs,
            timeouts: self.timeouts,
        }
    }

    /// Credentials to authenticate with, if authentication is required.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.requires_authentication.then(|| Credentials {
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    #[must_use]
    pub const fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            compliance: if self.use_strict_address_parser {
                Compliance::Strict
            } else {
                Compliance::Loose
            },
            allow_unquoted_commas: self.allow_unquoted_commas,
            allow_addresses_without_domain: self.allow_addresses_without_domain,
        }
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_delay_ms),
            self.retry_count,
        )
    }

    /// Registers the handler invoked on every terminal failure.
    #[must_use]
    pub fn with_failure_handler(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.failure_handler = Some(FailureCallback::new(handler));
        self
    }
}

/// A validated, immutable view of [`SenderOptions`].
///
/// Each queued message keeps the snapshot it was prepared under for its whole
/// lifetime.
#[derive(Debug)]
pub struct Snapshot {
    pub options: SenderOptions,
    pub whitelist: AHashSet<String>,
    pub parser: ParserOptions,
    pub retry: RetryPolicy,
    pub endpoint: Endpoint,
    pub credentials: Option<Credentials>,
}

impl Snapshot {
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the options fail validation.
    pub fn new(options: SenderOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        Ok(Self {
            whitelist: options.whitelist.iter().cloned().collect(),
            parser: options.parser_options(),
            retry: options.retry_policy(),
            endpoint: options.endpoint(),
            credentials: options.credentials(),
            options,
        })
    }

    pub fn failure_handler(&self) -> Option<&Arc<dyn FailureHandler>> {
        self.options.failure_handler.as_ref().map(|cb| &cb.0)
    }
}
