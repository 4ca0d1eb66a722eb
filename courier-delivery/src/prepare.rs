//! Turns an [`EmailMessage`] into the [`Mail`] a transport sends.
//!
//! Recipients are rewritten (when temp-mail routing is enabled), deduplicated
//! and whitelist-filtered. Inline attachments are then bound to their
//! placeholders, From and Sender are resolved from the account settings, and
//! the remaining recipients are parsed. Nothing here returns an error: every
//! problem resolves to a [`Disposition`].

use std::{borrow::Cow, sync::LazyLock};

use ahash::AHashSet;
use courier_common::tracing;
use courier_smtp::{
    address::{Mailbox, ParserOptions, parse_mailbox},
    client::{Importance, Mail, MessageBuilder, generate_content_id},
};
use regex::Regex;

use crate::{
    config::{SenderOptions, Snapshot, is_email_address},
    message::EmailMessage,
};

/// Numeric tags appended by temp-mail services: `local+123@domain`.
#[allow(clippy::expect_used)]
static ROUTING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\+|\.|-)[0-9]+@").expect("routing pattern is valid"));

/// A message ready for a transport. Always has at least one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMail {
    pub mail: Mail,
}

impl PreparedMail {
    #[must_use]
    pub fn recipients(&self) -> &[Mailbox] {
        &self.mail.recipients
    }
}

/// What to do with a submitted message.
#[derive(Debug)]
pub enum Disposition {
    Send(PreparedMail),
    /// Nothing to send, and that counts as success.
    Succeed,
    /// Nothing to send; the message is invalid.
    Reject,
}

/// Validates and renders `message` under `snapshot`.
pub fn prepare(message: &EmailMessage, snapshot: &Snapshot) -> Disposition {
    let options = &snapshot.options;

    let recipients = filter_recipients(
        &message.recipients,
        options.enable_temp_mail_routing,
        &snapshot.whitelist,
    );
    if recipients.is_empty() {
        return no_recipients(options);
    }

    let Some(builder) = build_body(message, options) else {
        return Disposition::Reject;
    };

    let Some((from, sender)) = resolve_from(options, &snapshot.parser) else {
        return Disposition::Reject;
    };

    let mailboxes: Vec<Mailbox> = recipients
        .iter()
        .filter_map(|recipient| match parse_mailbox(recipient, &snapshot.parser) {
            Ok(mailbox) => Some(mailbox),
            Err(e) => {
                tracing::warn!(
                    %recipient,
                    error = %e,
                    "Skipped recipient because it is not a valid email address"
                );
                None
            }
        })
        .collect();
    if mailboxes.is_empty() {
        tracing::warn!("All remaining recipients had invalid addresses");
        return no_recipients(options);
    }

    let headers: Vec<String> = mailboxes.iter().map(Mailbox::header_value).collect();
    let mut builder = builder
        .from(from.header_value())
        .to_multiple(&headers[..])
        .subject(message.subject.as_str())
        .importance(if message.high_importance {
            Importance::High
        } else {
            Importance::Normal
        });
    if let Some(sender) = &sender {
        builder = builder.sender(sender.header_value());
    }

    match builder.build() {
        Ok(content) => Disposition::Send(PreparedMail {
            mail: Mail {
                from,
                sender,
                recipients: mailboxes,
                content,
            },
        }),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build message");
            Disposition::Reject
        }
    }
}

/// Rewrites, deduplicates and whitelist-filters recipients, keeping the order
/// of first occurrence.
fn filter_recipients(
    recipients: &[String],
    routing: bool,
    whitelist: &AHashSet<String>,
) -> Vec<String> {
    let mut seen = AHashSet::with_capacity(recipients.len());
    let mut filtered = Vec::with_capacity(recipients.len());

    for recipient in recipients {
        let recipient = if routing {
            rewrite_routing_tag(recipient)
        } else {
            Cow::Borrowed(recipient.as_str())
        };

        if !seen.insert(recipient.clone()) {
            continue;
        }

        if !whitelist.is_empty() && !whitelist.contains(&*recipient) {
            tracing::info!(%recipient, "Recipient is not whitelisted and was removed");
            continue;
        }

        filtered.push(recipient.into_owned());
    }

    filtered
}

fn rewrite_routing_tag(recipient: &str) -> Cow<'_, str> {
    let rewritten = ROUTING_TAG.replace(recipient, "@");
    if let Cow::Owned(rewritten) = &rewritten {
        tracing::info!(%recipient, %rewritten, "Rewrote temp-mail routing address");
    }
    rewritten
}

fn no_recipients(options: &SenderOptions) -> Disposition {
    if options.treat_empty_recipients_as_success {
        tracing::info!("Message without deliverable recipients treated as sent");
        Disposition::Succeed
    } else {
        tracing::warn!("Message has no deliverable recipients");
        Disposition::Reject
    }
}

/// Resolves the From mailbox and, when it differs from the account, the
/// Sender.
fn resolve_from(
    options: &SenderOptions,
    parser: &ParserOptions,
) -> Option<(Mailbox, Option<Mailbox>)> {
    let account = options
        .username
        .as_deref()
        .filter(|username| options.requires_authentication && is_email_address(username));
    let from_address = options.from_address.as_deref();

    let parse = |address: &str, header: &str| match parse_mailbox(address, parser) {
        Ok(mailbox) => Some(mailbox),
        Err(e) => {
            tracing::error!(
                %address,
                error = %e,
                "Failed to parse address for the \"{header}\" header"
            );
            None
        }
    };

    match (account, from_address) {
        (Some(account), Some(from)) if from != account => {
            Some((parse(from, "From")?, Some(parse(account, "Sender")?)))
        }
        (Some(account), _) => Some((parse(account, "From")?, None)),
        (None, Some(from)) => Some((parse(from, "From")?, None)),
        (None, None) => {
            tracing::error!("No from address is configured");
            None
        }
    }
}

/// Domain of the configured From address, falling back to the account's.
fn sender_domain(options: &SenderOptions) -> &str {
    options
        .from_address
        .as_deref()
        .or(options.username.as_deref())
        .and_then(|address| address.rsplit_once('@'))
        .map_or("", |(_, domain)| domain.trim_end_matches('>'))
}

/// Adds the body and attachments, binding inline attachments to their
/// placeholders.
fn build_body(message: &EmailMessage, options: &SenderOptions) -> Option<MessageBuilder> {
    let mut body = message.body.trim().to_string();
    let mut builder = MessageBuilder::new();
    let domain = sender_domain(options);

    for attachment in &message.attachments {
        let Some(placeholder) = &attachment.placeholder else {
            builder = builder.attach(
                attachment.filename.as_str(),
                attachment.content_type(),
                attachment.content.clone(),
            );
            continue;
        };

        let content_id = generate_content_id(domain);
        if placeholder.is_empty() || !body.contains(placeholder.as_str()) {
            if options.verify_inline_attachments {
                tracing::error!(
                    filename = %attachment.filename,
                    %placeholder,
                    "Inline attachment placeholder not found in body"
                );
                return None;
            }
            tracing::warn!(
                filename = %attachment.filename,
                %placeholder,
                "Inline attachment placeholder not found in body, embedding it unreferenced"
            );
        } else {
            body = body.replace(placeholder.as_str(), &format!("cid:{content_id}"));
        }

        builder = builder.inline(
            content_id,
            attachment.filename.as_str(),
            attachment.content_type(),
            attachment.content.clone(),
        );
    }

    Some(builder.html_body(body))
}
