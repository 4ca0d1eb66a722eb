//! Mailbox parsing for recipient and sender addresses.
//!
//! Two compliance levels are supported:
//!
//! - [`Compliance::Strict`] validates the addr-spec against RFC 5321
//!   Section 4.1.2 (`Dot-string` / `Quoted-string` local parts, LDH domains
//!   or address literals, 64/255 octet limits).
//! - [`Compliance::Loose`] only requires something shaped like
//!   `local@domain` with no whitespace or control characters, which is what
//!   most submission servers accept in practice.
//!
//! Both levels understand the `Display Name <local@domain>` form. A display
//! name containing an unquoted comma (`Doe, John <john@example.com>`) is
//! accepted only when [`ParserOptions::allow_unquoted_commas`] is set; a
//! bare address containing a comma is always a list, not a mailbox.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AddressError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,
    #[error("Local-part exceeds 64 octets")]
    LocalPartTooLong,
    #[error("Domain exceeds 255 octets")]
    DomainTooLong,
    #[error("Missing closing angle bracket '>'")]
    MissingCloseBracket,
    #[error("Unexpected characters after '>'")]
    TrailingCharacters,
    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,
    #[error("Display name contains an unquoted comma")]
    UnquotedComma,
    #[error("Display name contains a control character")]
    InvalidDisplayName,
    #[error("Input contains more than one address")]
    MultipleAddresses,
    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    #[error("Invalid address literal: {0}")]
    InvalidAddressLiteral(String),
    #[error("Unclosed quoted string in local-part")]
    UnclosedQuotedString,
    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compliance {
    Strict,
    #[default]
    Loose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserOptions {
    pub compliance: Compliance,
    pub allow_unquoted_commas: bool,
    /// Accept a bare local part (`postmaster`) with an empty domain.
    pub allow_addresses_without_domain: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            compliance: Compliance::Loose,
            allow_unquoted_commas: true,
            allow_addresses_without_domain: true,
        }
    }
}

/// A parsed mailbox. `Display` renders the bare address used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mailbox {
    pub display_name: Option<String>,
    pub local_part: String,
    /// Empty for domain-less mailboxes.
    pub domain: String,
}

impl Mailbox {
    #[must_use]
    pub fn new(local_part: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            display_name: None,
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }

    /// The mailbox as written in a header: `"Name" <address>` or `address`.
    #[must_use]
    pub fn header_value(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{self}>", name.replace('"', "\\\"")),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.local_part)
        } else {
            write!(f, "{}@{}", self.local_part, self.domain)
        }
    }
}

/// Parses a single mailbox, optionally preceded by a display name.
///
/// # Errors
///
/// Returns `AddressError` describing the first problem found.
pub fn parse_mailbox(input: &str, options: &ParserOptions) -> Result<Mailbox> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    let (display_name, addr_spec) = if let Some(open) = find_unquoted(trimmed, '<') {
        let close = trimmed
            .rfind('>')
            .filter(|&close| close > open)
            .ok_or(AddressError::MissingCloseBracket)?;
        if !trimmed[close + 1..].trim().is_empty() {
            return Err(AddressError::TrailingCharacters);
        }

        let name = parse_display_name(trimmed[..open].trim(), options)?;
        (name, trimmed[open + 1..close].trim())
    } else {
        if find_unquoted(trimmed, ',').is_some() {
            return Err(AddressError::MultipleAddresses);
        }
        (None, trimmed)
    };

    if addr_spec.is_empty() {
        return Err(AddressError::Empty);
    }

    let (local_part, domain) = match find_unquoted(addr_spec, '@') {
        Some(at) => (&addr_spec[..at], Some(&addr_spec[at + 1..])),
        None if options.allow_addresses_without_domain => (addr_spec, None),
        None => return Err(AddressError::MissingAtSign),
    };

    match options.compliance {
        Compliance::Strict => {
            validate_local_part(local_part)?;
            if let Some(domain) = domain {
                validate_domain(domain)?;
            }
        }
        Compliance::Loose => {
            validate_loose(local_part).map_err(AddressError::InvalidLocalPart)?;
            if let Some(domain) = domain {
                validate_loose(domain).map_err(AddressError::InvalidDomain)?;
            }
        }
    }

    Ok(Mailbox {
        display_name,
        local_part: local_part.to_string(),
        domain: domain.unwrap_or_default().to_string(),
    })
}

fn parse_display_name(name: &str, options: &ParserOptions) -> Result<Option<String>> {
    if name.is_empty() {
        return Ok(None);
    }
    if name.chars().any(char::is_control) {
        return Err(AddressError::InvalidDisplayName);
    }

    if let Some(quoted) = name
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return Ok(Some(unescape(quoted)));
    }

    if !options.allow_unquoted_commas && find_unquoted(name, ',').is_some() {
        return Err(AddressError::UnquotedComma);
    }

    Ok(Some(name.to_string()))
}

fn unescape(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Byte offset of the first `target` outside quotes and address literals.
fn find_unquoted(input: &str, target: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;

    for (i, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' if !in_brackets => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            c if c == target && !in_quotes && !in_brackets => return Some(i),
            _ => {}
        }
    }

    None
}

/// Loose rule: non-empty, no control characters, and outside quotes no
/// whitespace or angle brackets.
fn validate_loose(part: &str) -> std::result::Result<(), String> {
    if part.is_empty() {
        return Err("empty".to_string());
    }

    let quoted = part.starts_with('"');
    match part.chars().find(|&c| {
        c.is_control() || (!quoted && (c.is_whitespace() || matches!(c, '<' | '>' | '@')))
    }) {
        Some(ch) => Err(format!("invalid character '{}'", ch.escape_default())),
        None => Ok(()),
    }
}

/// `Dot-string / Quoted-string`
fn validate_local_part(local: &str) -> Result<()> {
    if local.len() > 64 {
        return Err(AddressError::LocalPartTooLong);
    }
    if local.starts_with('"') {
        return validate_quoted(local);
    }

    for atom in local.split('.') {
        if atom.is_empty() {
            return Err(AddressError::InvalidLocalPart(
                "atoms must be non-empty and separated by single dots".to_string(),
            ));
        }
        if let Some(ch) = atom.chars().find(|&c| !is_atext(c)) {
            return Err(AddressError::InvalidLocalPart(format!(
                "invalid character '{ch}' in atom"
            )));
        }
    }

    Ok(())
}

/// `DQUOTE *QcontentSMTP DQUOTE`
fn validate_quoted(local: &str) -> Result<()> {
    let inner = local
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or(AddressError::UnclosedQuotedString)?;

    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(' '..='~') => {}
                Some(other) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "invalid quoted-pair \\{other}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "backslash at end of quoted string".to_string(),
                    ));
                }
            },
            c if is_qtext_smtp(c) => {}
            c => {
                return Err(AddressError::InvalidQuotedString(format!(
                    "invalid character '{c}'"
                )));
            }
        }
    }

    Ok(())
}

/// `Domain / address-literal`
fn validate_domain(domain: &str) -> Result<()> {
    if domain.len() > 255 {
        return Err(AddressError::DomainTooLong);
    }
    if let Some(literal) = domain.strip_prefix('[') {
        return validate_address_literal(literal);
    }
    if domain.is_empty() {
        return Err(AddressError::InvalidDomain("empty domain".to_string()));
    }

    for label in domain.split('.') {
        let bytes = label.as_bytes();
        let well_bounded = matches!(
            (bytes.first(), bytes.last()),
            (Some(first), Some(last)) if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
        );
        if !well_bounded {
            return Err(AddressError::InvalidDomain(format!(
                "label '{label}' must start and end with a letter or digit"
            )));
        }
        if let Some(ch) = label.chars().find(|&c| !c.is_ascii_alphanumeric() && c != '-') {
            return Err(AddressError::InvalidDomain(format!(
                "invalid character '{ch}' in label"
            )));
        }
    }

    Ok(())
}

/// `[IPv4]`, `[IPv6:...]` or `[tag:value]`, with the opening bracket removed.
fn validate_address_literal(literal: &str) -> Result<()> {
    let content = literal
        .strip_suffix(']')
        .ok_or_else(|| AddressError::InvalidAddressLiteral("missing ']'".to_string()))?;

    let valid = content.parse::<Ipv4Addr>().is_ok()
        || content
            .strip_prefix("IPv6:")
            .is_some_and(|v6| v6.parse::<Ipv6Addr>().is_ok())
        || content
            .split_once(':')
            .is_some_and(|(tag, value)| !tag.is_empty() && !value.is_empty());

    if valid {
        Ok(())
    } else {
        Err(AddressError::InvalidAddressLiteral(content.to_string()))
    }
}

/// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" /
///         "-" / "/" / "=" / "?" / "^" / "_" / "`" / "{" / "|" / "}" / "~"
const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// qtextSMTP = %d32-33 / %d35-91 / %d93-126
const fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch, ' '..='!' | '#'..='[' | ']'..='~')
}
