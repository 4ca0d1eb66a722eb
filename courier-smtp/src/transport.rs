//! The transport seam used by the delivery engine.
//!
//! [`Transport`] is the connect/authenticate/send/disconnect surface the
//! engine drives; [`SmtpTransport`] implements it on top of [`SmtpClient`].

use async_trait::async_trait;
use courier_common::tracing;
use serde::{Deserialize, Serialize};

use crate::client::{ClientError, Mail, Result, SmtpClient, SmtpTimeouts};

/// How STARTTLS is negotiated after the greeting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// Fail the connection if the server does not offer STARTTLS.
    #[default]
    Required,
    /// Upgrade when offered, continue in plain text otherwise.
    Opportunistic,
    /// Never upgrade.
    Disabled,
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Name announced in EHLO/HELO.
    pub helo_domain: String,
    pub tls: TlsMode,
    pub accept_invalid_certs: bool,
    pub timeouts: SmtpTimeouts,
}

impl Endpoint {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A reusable mail-submission session.
#[async_trait]
pub trait Transport: Send {
    fn is_connected(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    /// Opens a session, replacing any existing one.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()>;

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<()>;

    /// Cheap round trip to check an idle session is still usable.
    async fn noop(&mut self) -> Result<()>;

    async fn send(&mut self, mail: &Mail) -> Result<()>;

    /// Ends the session politely. The transport can connect again afterwards.
    async fn disconnect(&mut self) -> Result<()>;

    /// Drops the session without a QUIT, for sessions left in an unknown state.
    fn abort(&mut self);

    /// Disconnects and refuses all further use with [`ClientError::Disposed`].
    async fn close(&mut self);
}

/// Creates fresh, unconnected transports.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

/// [`Transport`] backed by a real SMTP session.
#[derive(Default)]
pub struct SmtpTransport {
    client: Option<SmtpClient>,
    authenticated: bool,
    disposed: bool,
}

impl SmtpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&mut self) -> Result<&mut SmtpClient> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        self.client.as_mut().ok_or(ClientError::NotConnected)
    }

    async fn open(endpoint: &Endpoint) -> Result<SmtpClient> {
        let mut client = SmtpClient::connect(&endpoint.address(), &*endpoint.host, endpoint.timeouts)
            .await?
            .accept_invalid_certs(endpoint.accept_invalid_certs);

        client.read_greeting().await?.expect_code(220)?;
        greet(&mut client, &endpoint.helo_domain).await?;

        let offered = client.capabilities().starttls;
        match (endpoint.tls, offered) {
            (TlsMode::Disabled, _) | (TlsMode::Opportunistic, false) => {}
            (TlsMode::Required, false) => {
                return Err(ClientError::TlsError(
                    "Server does not offer STARTTLS".to_string(),
                ));
            }
            (TlsMode::Required | TlsMode::Opportunistic, true) => {
                client.starttls().await?.expect_code(220)?;
                greet(&mut client, &endpoint.helo_domain).await?;
            }
        }

        Ok(client)
    }
}

/// EHLO, falling back to HELO for servers that reject it.
async fn greet(client: &mut SmtpClient, domain: &str) -> Result<()> {
    let ehlo = client.ehlo(domain).await?;
    if !ehlo.is_success() {
        client.helo(domain).await?.expect_success()?;
    }
    Ok(())
}

#[async_trait]
impl Transport for SmtpTransport {
    fn is_connected(&self) -> bool {
        !self.disposed && self.client.is_some()
    }

    fn is_authenticated(&self) -> bool {
        self.is_connected() && self.authenticated
    }

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.disposed {
            return Err(ClientError::Disposed);
        }
        self.abort();

        self.client = Some(Self::open(endpoint).await?);
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "Connected to SMTP server");
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        let client = self.client()?;
        let capabilities = client.capabilities().clone();

        if capabilities.supports_auth("PLAIN") {
            client
                .auth_plain(&credentials.username, &credentials.password)
                .await?;
        } else if capabilities.supports_auth("LOGIN") {
            client
                .auth_login(&credentials.username, &credentials.password)
                .await?;
        } else {
            return Err(ClientError::AuthError(
                "Server offers no supported mechanism (PLAIN, LOGIN)".to_string(),
            ));
        }

        self.authenticated = true;
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        self.client()?.noop().await?.expect_success()?;
        Ok(())
    }

    async fn send(&mut self, mail: &Mail) -> Result<()> {
        let client = self.client()?;
        let size = client.capabilities().size.map(|_| mail.content.len());

        let transaction = async {
            client
                .mail_from(&mail.reverse_path().to_string(), size)
                .await?
                .expect_success()?;
            for recipient in &mail.recipients {
                client
                    .rcpt_to(&recipient.to_string())
                    .await?
                    .expect_success()?;
            }
            client.data().await?.expect_code(354)?;
            client.send_data(&mail.content).await?.expect_success()?;
            Ok::<_, ClientError>(())
        }
        .await;

        match transaction {
            Err(ClientError::SmtpError { code, message }) => {
                // leave the session ready for the next message
                if let Err(e) = client.rset().await {
                    tracing::debug!(error = %e, "RSET after rejected transaction failed");
                    self.abort();
                }
                Err(ClientError::SmtpError { code, message })
            }
            Err(e) if e.is_connection_error() => {
                self.abort();
                Err(e)
            }
            other => other,
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.authenticated = false;
        match self.client.take() {
            Some(mut client) => client.quit().await.map(|_| ()),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        self.client = None;
        self.authenticated = false;
    }

    async fn close(&mut self) {
        if let Err(e) = self.disconnect().await {
            tracing::debug!(error = %e, "QUIT failed while closing transport");
        }
        self.disposed = true;
    }
}

/// Produces [`SmtpTransport`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpTransportFactory;

impl TransportFactory for SmtpTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(SmtpTransport::new())
    }
}
