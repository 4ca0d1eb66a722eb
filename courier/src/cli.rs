//! Command-line interface.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use courier_common::{internal, logging};
use courier_delivery::{EmailAttachment, EmailMessage, EmailSender, LivenessMonitor};
use tokio_util::sync::CancellationToken;

use crate::config::{CourierConfig, find_config_file};

/// Send mail through a pooled, retrying SMTP submission engine
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Send mail through a pooled, retrying SMTP submission engine", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the configuration file (overrides `COURIER_CONFIG`)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one message and wait for the outcome
    Send {
        /// Recipient address (repeatable)
        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long, default_value = "")]
        subject: String,

        /// HTML body
        #[arg(long, default_value = "")]
        body: String,

        /// File to attach (repeatable)
        #[arg(long)]
        attach: Vec<PathBuf>,

        /// Inline file referenced from the body, as PATH=PLACEHOLDER (repeatable)
        #[arg(long, value_parser = parse_inline)]
        inline: Vec<InlineSpec>,

        #[arg(long)]
        high_importance: bool,
    },
    /// Check that the server is reachable and the credentials are accepted
    Check,
    /// Probe the server periodically and log liveness reports until interrupted
    Monitor {
        /// Seconds between liveness reports
        #[arg(long, default_value_t = 60)]
        report_every: u64,
    },
}

/// A parsed command whose inputs have been read.
#[derive(Debug)]
enum Action {
    Send(EmailMessage),
    Check,
    Monitor(Duration),
}

/// An inline attachment given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineSpec {
    pub path: PathBuf,
    pub placeholder: String,
}

fn parse_inline(value: &str) -> Result<InlineSpec, String> {
    let (path, placeholder) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=PLACEHOLDER, got {value}"))?;

    if path.is_empty() || placeholder.is_empty() {
        return Err(format!("expected PATH=PLACEHOLDER, got {value}"));
    }

    Ok(InlineSpec {
        path: PathBuf::from(path),
        placeholder: placeholder.to_string(),
    })
}

impl Cli {
    /// Runs the selected command.
    ///
    /// # Errors
    ///
    /// Fails if the configuration cannot be loaded, an attachment cannot be
    /// read, or the command itself fails.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let path = find_config_file(self.config.as_deref())?;
        let config = CourierConfig::load(&path)?;
        internal!(level = DEBUG, "Loaded configuration from {}", path.display());

        // read inputs before the sender starts
        let action = self.command.into_action().await?;

        let sender = EmailSender::new(config.sender)?;
        let cancel = CancellationToken::new();
        let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

        let result = match action {
            Action::Send(message) => send(&sender, message, &cancel).await,
            Action::Check => check(&sender, &cancel).await,
            Action::Monitor(report_every) => {
                monitor(&sender, config.liveness, report_every, &cancel).await;
                Ok(())
            }
        };

        signals.abort();
        sender.shutdown().await;
        result
    }
}

impl Command {
    async fn into_action(self) -> anyhow::Result<Action> {
        Ok(match self {
            Self::Send {
                to,
                subject,
                body,
                attach,
                inline,
                high_importance,
            } => {
                let mut message = EmailMessage::new(to, subject, body);
                message.high_importance = high_importance;
                message.attachments = read_attachments(&attach, &inline).await?;
                Action::Send(message)
            }
            Self::Check => Action::Check,
            Self::Monitor { report_every } => {
                Action::Monitor(Duration::from_secs(report_every.max(1)))
            }
        })
    }
}

async fn read_attachments(
    attach: &[PathBuf],
    inline: &[InlineSpec],
) -> anyhow::Result<Vec<EmailAttachment>> {
    let mut attachments = Vec::with_capacity(attach.len() + inline.len());

    for path in attach {
        attachments.push(read(path).await?);
    }
    for spec in inline {
        let mut attachment = read(&spec.path).await?;
        attachment.placeholder = Some(spec.placeholder.clone());
        attachments.push(attachment);
    }

    Ok(attachments)
}

async fn read(path: &Path) -> anyhow::Result<EmailAttachment> {
    EmailAttachment::from_path(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read attachment {}: {e}", path.display()))
}

async fn send(
    sender: &EmailSender,
    message: EmailMessage,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if sender.send(message, cancel).await? {
        tracing::info!("Message delivered");
        Ok(())
    } else {
        anyhow::bail!("Message was not delivered")
    }
}

async fn check(sender: &EmailSender, cancel: &CancellationToken) -> anyhow::Result<()> {
    sender.test_connection(cancel).await?;
    tracing::info!("SMTP server is reachable");
    Ok(())
}

async fn monitor(
    sender: &EmailSender,
    options: courier_delivery::LivenessOptions,
    report_every: Duration,
    cancel: &CancellationToken,
) {
    let monitor = LivenessMonitor::spawn(Arc::new(sender.clone()), options);
    let mut reports = tokio::time::interval(report_every);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = reports.tick() => {
                let snapshot = monitor.snapshot();
                match &snapshot.last_error {
                    None => tracing::info!(
                        failed = snapshot.failed_count,
                        next_probe_in_secs = snapshot.next_probe_in_secs,
                        "Liveness: healthy"
                    ),
                    Some(error) => tracing::warn!(
                        %error,
                        failed = snapshot.failed_count,
                        next_probe_in_secs = snapshot.next_probe_in_secs,
                        "Liveness: unhealthy"
                    ),
                }
            }
        }
    }

    monitor.stop().await;
}

/// Cancels `cancel` on CTRL+C or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        let Ok(mut terminate) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            tracing::warn!("Unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
            return;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!("CTRL+C entered, shutting down");
            }
            _ = terminate.recv() => {
                internal!("Terminate Signal received, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        internal!("CTRL+C entered, shutting down");
    }

    cancel.cancel();
}
