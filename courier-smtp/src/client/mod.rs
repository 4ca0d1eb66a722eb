//! SMTP submission client.
//!
//! [`SmtpClient`] speaks the command/reply protocol over plain TCP, upgraded
//! with STARTTLS when the server offers it, and authenticates with
//! `AUTH PLAIN` or `AUTH LOGIN`. [`MessageBuilder`] renders the MIME content
//! that is sent after `DATA`.
//!
//! ```no_run
//! use courier_smtp::client::{SmtpClient, SmtpTimeouts};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("localhost:2525", "mail.example.com", SmtpTimeouts::default()).await?;
//! client.read_greeting().await?;
//! client.ehlo("client.example.com").await?;
//! client.mail_from("sender@example.com", None).await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data("Subject: Test\r\n\r\nHello World").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod message;
mod response;
mod smtp_client;
mod timeouts;

pub use error::{ClientError, Result};
pub use message::{
    Attachment, Importance, Mail, MessageBuilder, generate_content_id, guess_content_type,
};
pub use response::{Capabilities, Response, ResponseLine};
pub use smtp_client::SmtpClient;
pub use timeouts::SmtpTimeouts;
