//! The logical message submitted by callers.

use std::path::Path;

use courier_smtp::client::guess_content_type;

/// A file carried by an [`EmailMessage`].
///
/// An attachment with a `placeholder` is embedded inline: every occurrence of
/// the placeholder in the body is replaced with a `cid:` reference to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub placeholder: Option<String>,
}

impl EmailAttachment {
    #[must_use]
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
            placeholder: None,
        }
    }

    #[must_use]
    pub fn inline(
        filename: impl Into<String>,
        content: Vec<u8>,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content,
            placeholder: Some(placeholder.into()),
        }
    }

    /// Reads an attachment from disk, named after the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map_or_else(|| "attachment".to_string(), |n| n.to_string_lossy().into_owned());
        let content = tokio::fs::read(path).await?;

        Ok(Self::new(filename, content))
    }

    #[must_use]
    pub fn content_type(&self) -> String {
        guess_content_type(&self.filename)
    }

    #[must_use]
    pub const fn is_inline(&self) -> bool {
        self.placeholder.is_some()
    }
}

/// A mail as the caller describes it, before validation.
///
/// Recipients are kept verbatim; duplicates and unparseable entries are dealt
/// with during preparation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub subject: String,
    /// HTML body text.
    pub body: String,
    pub high_importance: bool,
    pub attachments: Vec<EmailAttachment>,
}

impl EmailMessage {
    #[must_use]
    pub fn new<R, S>(recipients: R, subject: impl Into<String>, body: impl Into<String>) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recipients: recipients.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: EmailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    #[must_use]
    pub const fn with_high_importance(mut self) -> Self {
        self.high_importance = true;
        self
    }
}
