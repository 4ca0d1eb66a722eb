//! SMTP client implementation with support for STARTTLS and SASL authentication.

use std::{future::Future, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, Result},
    response::{Capabilities, Response},
    timeouts::SmtpTimeouts,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let connector = TlsConnector::from(Arc::new(tls_config(accept_invalid_certs)?));
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

fn tls_config(accept_invalid_certs: bool) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        tracing::warn!("Server certificate validation is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    }

    Ok(config)
}

/// Verifier installed when certificate validation has been switched off.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Runs `operation`, converting an elapsed `limit` into [`ClientError::Timeout`].
async fn timed<T>(
    limit: Duration,
    step: &'static str,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| ClientError::Timeout(step))?
}

/// A single SMTP session with a submission server.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    accept_invalid_certs: bool,
    capabilities: Capabilities,
    timeouts: SmtpTimeouts,
}

impl SmtpClient {
    /// Opens a TCP connection to `addr`. `server_domain` is the name the
    /// certificate is checked against after STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or does not complete within
    /// the connect timeout.
    pub async fn connect(
        addr: &str,
        server_domain: impl Into<String>,
        timeouts: SmtpTimeouts,
    ) -> Result<Self> {
        let stream = timed(timeouts.connect(), "connect", async {
            Ok(TcpStream::connect(addr).await?)
        })
        .await?;

        Ok(Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: server_domain.into(),
            accept_invalid_certs: false,
            capabilities: Capabilities::default(),
            timeouts,
        })
    }

    /// Sets whether to accept invalid TLS certificates. Default is `false`.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Extensions from the most recent successful EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Reads the initial server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or times out.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let limit = self.timeouts.connect();
        timed(limit, "greeting", self.read_response()).await
    }

    /// Sends a command line and reads the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails or times out.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        let limit = self.timeouts.command();
        timed(limit, "command", self.exchange(command)).await
    }

    /// Like [`SmtpClient::command`], but keeps the line out of the logs.
    async fn secret_command(&mut self, command: &str) -> Result<Response> {
        outgoing!("<credentials>");
        let limit = self.timeouts.command();
        timed(limit, "authentication", self.exchange(command)).await
    }

    async fn exchange(&mut self, command: &str) -> Result<Response> {
        let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
        connection.send(format!("{command}\r\n").as_bytes()).await?;
        connection.flush().await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        if response.is_success() {
            self.capabilities = Capabilities::from_ehlo(&response);
        }
        Ok(response)
    }

    /// Sends HELO, for servers that do not speak ESMTP.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.capabilities = Capabilities::default();
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends STARTTLS and, when the server agrees, upgrades the connection.
    /// Capabilities are cleared: the caller must EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if response.code != 220 {
            return Ok(response);
        }

        let old_connection = self.connection.take().ok_or(ClientError::NotConnected)?;
        let limit = self.timeouts.command();
        let upgraded = timed(
            limit,
            "TLS handshake",
            old_connection.upgrade_to_tls(&self.server_domain, self.accept_invalid_certs),
        )
        .await?;

        self.connection = Some(upgraded);
        self.buffer_pos = 0;
        self.capabilities = Capabilities::default();

        Ok(response)
    }

    /// Authenticates with `AUTH PLAIN`.
    ///
    /// # Errors
    ///
    /// `AuthError` if the server rejects the credentials.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        let response = self.secret_command(&format!("AUTH PLAIN {token}")).await?;
        expect_authenticated(response)
    }

    /// Authenticates with `AUTH LOGIN`.
    ///
    /// # Errors
    ///
    /// `AuthError` if the server rejects either step.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        let challenge = self.command("AUTH LOGIN").await?;
        if challenge.code != 334 {
            return expect_authenticated(challenge);
        }

        let challenge = self.secret_command(&STANDARD.encode(username)).await?;
        if challenge.code != 334 {
            return expect_authenticated(challenge);
        }

        let response = self.secret_command(&STANDARD.encode(password)).await?;
        expect_authenticated(response)
    }

    /// Sends MAIL FROM, with the SIZE parameter when known.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = if let Some(sz) = size {
            format!("MAIL FROM:<{from}> SIZE={sz}")
        } else {
            format!("MAIL FROM:<{from}>")
        };
        self.command(&cmd).await
    }

    /// Sends RCPT TO.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA. The server should answer 354.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Transmits the message content, dot-stuffed and terminated by `.`, and
    /// reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or reading fails or times out.
    pub async fn send_data(&mut self, data: &str) -> Result<Response> {
        outgoing!("<{} bytes of message data>", data.len());
        let limit = self.timeouts.data();
        timed(limit, "message transfer", async {
            let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
            connection.send(dot_stuff(data).as_bytes()).await?;
            connection.flush().await?;
            self.read_response().await
        })
        .await
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// Sends RSET to abandon the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends QUIT.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

fn expect_authenticated(response: Response) -> Result<Response> {
    if response.code == 235 {
        Ok(response)
    } else {
        Err(ClientError::AuthError(format!(
            "{} {}",
            response.code,
            response.message()
        )))
    }
}

/// Normalises line endings to CRLF, doubles leading dots and appends the
/// end-of-data marker.
pub(crate) fn dot_stuff(data: &str) -> String {
    let body = data
        .strip_suffix("\r\n")
        .or_else(|| data.strip_suffix('\n'))
        .unwrap_or(data);

    let mut out = String::with_capacity(body.len() + 64);
    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}
