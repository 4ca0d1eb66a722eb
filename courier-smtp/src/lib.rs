//! Mail-submission plumbing for courier: an SMTP client with STARTTLS and
//! SASL authentication, a MIME message builder, mailbox parsing, and the
//! [`Transport`] trait the delivery engine drives.

pub mod address;
pub mod client;
mod transport;

pub use transport::{
    Credentials, Endpoint, SmtpTransport, SmtpTransportFactory, TlsMode, Transport,
    TransportFactory,
};
