//! Email message builder with support for HTML bodies, inline resources and
//! attachments.

use std::{borrow::Cow, fmt::Write as _, path::Path};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ulid::Ulid;

use super::error::{ClientError, Result};
use crate::address::Mailbox;

/// Column at which base64 payloads are wrapped.
const BASE64_LINE: usize = 76;

/// RFC 5322 hard limit on line length, excluding CRLF.
const MAX_LINE: usize = 998;

/// A MIME part carrying binary content.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// The filename to use in the MIME header.
    pub filename: String,
    /// The MIME content type (e.g., "application/pdf").
    pub content_type: String,
    pub data: Vec<u8>,
    /// Set for inline parts referenced from the body as `cid:<content_id>`.
    pub content_id: Option<String>,
}

/// Message priority as expressed by the `Importance` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Importance {
    #[default]
    Normal,
    High,
}

/// The envelope and rendered content handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub from: Mailbox,
    /// The submitting identity when it differs from `from`.
    pub sender: Option<Mailbox>,
    pub recipients: Vec<Mailbox>,
    pub content: String,
}

impl Mail {
    /// Address used for `MAIL FROM`: the sender when present, otherwise `from`.
    #[must_use]
    pub fn reverse_path(&self) -> &Mailbox {
        self.sender.as_ref().unwrap_or(&self.from)
    }
}

/// Builder for constructing email messages with proper MIME formatting.
///
/// The shape of the output depends on what was added:
/// - body only: a single `text/html` (or `text/plain`) part
/// - inline resources: `multipart/related` around the body
/// - attachments: `multipart/mixed` around the above
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    sender: Option<String>,
    to: Vec<String>,
    subject: Option<String>,
    body: Option<String>,
    html: bool,
    importance: Importance,
    inline: Vec<Attachment>,
    attachments: Vec<Attachment>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the From header.
    #[must_use]
    pub fn from(mut self, email: impl Into<String>) -> Self {
        self.from = Some(email.into());
        self
    }

    /// Sets the Sender header.
    #[must_use]
    pub fn sender(mut self, email: impl Into<String>) -> Self {
        self.sender = Some(email.into());
        self
    }

    /// Adds a recipient to the To header.
    #[must_use]
    pub fn to(mut self, email: impl Into<String>) -> Self {
        self.to.push(email.into());
        self
    }

    /// Adds multiple recipients to the To header.
    #[must_use]
    pub fn to_multiple(mut self, emails: &[impl AsRef<str>]) -> Self {
        self.to
            .extend(emails.iter().map(|email| email.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets a plain text body.
    #[must_use]
    pub fn body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(content.into());
        self.html = false;
        self
    }

    /// Sets an HTML body.
    #[must_use]
    pub fn html_body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(content.into());
        self.html = true;
        self
    }

    #[must_use]
    pub const fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    /// Adds a regular attachment.
    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
            content_id: None,
        });
        self
    }

    /// Adds an inline resource the body refers to as `cid:<content_id>`.
    #[must_use]
    pub fn inline(
        mut self,
        content_id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.inline.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
            content_id: Some(content_id.into()),
        });
        self
    }

    /// Renders the message.
    ///
    /// # Errors
    ///
    /// Returns an error if no From address was set.
    pub fn build(self) -> Result<String> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| ClientError::BuilderError("A From address is required".to_string()))?;

        let mut message = String::with_capacity(2048);
        write_header(&mut message, "From", from);
        if let Some(sender) = &self.sender {
            write_header(&mut message, "Sender", sender);
        }
        if !self.to.is_empty() {
            write_header(&mut message, "To", &self.to.join(", "));
        }
        if let Some(subject) = &self.subject {
            write_header(&mut message, "Subject", &encode_word(subject));
        }
        write_header(&mut message, "Date", &chrono::Utc::now().to_rfc2822());
        write_header(
            &mut message,
            "Message-ID",
            &format!("<{}@{}>", Ulid::new(), domain_of(from)),
        );
        let (importance, priority) = match self.importance {
            Importance::High => ("high", "1"),
            Importance::Normal => ("normal", "3"),
        };
        write_header(&mut message, "Importance", importance);
        write_header(&mut message, "X-Priority", priority);
        write_header(&mut message, "MIME-Version", "1.0");

        let body_type = if self.html { "text/html" } else { "text/plain" };
        let body = self.body.as_deref().unwrap_or_default();

        if self.attachments.is_empty() {
            write_related(&mut message, body_type, body, &self.inline);
        } else {
            let boundary = generate_boundary();
            let _ = write!(
                message,
                "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
            );
            let _ = write!(message, "--{boundary}\r\n");
            write_related(&mut message, body_type, body, &self.inline);
            for attachment in &self.attachments {
                let _ = write!(message, "\r\n--{boundary}\r\n");
                write_binary_part(&mut message, attachment, "attachment");
            }
            let _ = write!(message, "\r\n--{boundary}--\r\n");
        }

        Ok(message)
    }
}

fn write_header(message: &mut String, name: &str, value: &str) {
    let _ = write!(message, "{name}: {}\r\n", single_line(value));
}

/// Collapses each run of control characters into one space so a value cannot
/// start a new header line.
fn single_line(value: &str) -> Cow<'_, str> {
    if !value.contains(is_line_control) {
        return Cow::Borrowed(value);
    }

    let mut line = String::with_capacity(value.len());
    let mut in_break = false;
    for ch in value.chars() {
        if is_line_control(ch) {
            if !in_break {
                line.push(' ');
            }
            in_break = true;
        } else {
            line.push(ch);
            in_break = false;
        }
    }
    Cow::Owned(line)
}

fn is_line_control(ch: char) -> bool {
    ch.is_control() && ch != '\t'
}

/// Writes the body, wrapped in `multipart/related` when it has inline parts.
fn write_related(message: &mut String, body_type: &str, body: &str, inline: &[Attachment]) {
    if inline.is_empty() {
        write_text_part(message, body_type, body);
        return;
    }

    let boundary = generate_boundary();
    let _ = write!(
        message,
        "Content-Type: multipart/related; type=\"{body_type}\"; boundary=\"{boundary}\"\r\n\r\n"
    );
    let _ = write!(message, "--{boundary}\r\n");
    write_text_part(message, body_type, body);
    for part in inline {
        let _ = write!(message, "\r\n--{boundary}\r\n");
        write_binary_part(message, part, "inline");
    }
    let _ = write!(message, "\r\n--{boundary}--\r\n");
}

fn write_text_part(message: &mut String, content_type: &str, text: &str) {
    let _ = write!(message, "Content-Type: {content_type}; charset=utf-8\r\n");
    if needs_base64(text) {
        let _ = write!(message, "Content-Transfer-Encoding: base64\r\n\r\n");
        message.push_str(&base64_wrapped(text.as_bytes()));
    } else {
        let _ = write!(message, "Content-Transfer-Encoding: 7bit\r\n\r\n");
        message.push_str(text);
    }
}

fn write_binary_part(message: &mut String, part: &Attachment, disposition: &str) {
    let _ = write!(
        message,
        "Content-Type: {}\r\n",
        single_line(&part.content_type)
    );
    let _ = write!(message, "Content-Transfer-Encoding: base64\r\n");
    let _ = write!(
        message,
        "Content-Disposition: {disposition}; filename=\"{}\"\r\n",
        single_line(&part.filename).replace('"', "'")
    );
    if let Some(id) = &part.content_id {
        let _ = write!(message, "Content-ID: <{}>\r\n", single_line(id));
    }
    message.push_str("\r\n");
    message.push_str(&base64_wrapped(&part.data));
}

/// Text that is not plain ASCII or has over-long lines cannot go out as 7bit.
fn needs_base64(text: &str) -> bool {
    !text.is_ascii() || text.lines().any(|line| line.len() > MAX_LINE)
}

/// Encodes data as base64 with line wrapping at 76 characters.
fn base64_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        // base64 output is ASCII, so every chunk boundary is a char boundary
        wrapped.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        wrapped.push_str("\r\n");
    }
    wrapped
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(value))
    }
}

fn domain_of(address: &str) -> &str {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('>'))
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost")
}

/// Generates a unique MIME boundary string.
fn generate_boundary() -> String {
    format!("=_courier_{}", Ulid::new())
}

/// Generates a globally unique `Content-ID` value for an inline part.
#[must_use]
pub fn generate_content_id(domain: &str) -> String {
    let domain = if domain.is_empty() { "localhost" } else { domain };
    format!("{}@{domain}", Ulid::new().to_string().to_ascii_lowercase())
}

/// Guesses the MIME content type based on file extension.
#[must_use]
pub fn guess_content_type(path: impl AsRef<Path>) -> String {
    let extension = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
    .to_string()
}
