//! Core types for the dispatch client.
//!
//! This module provides:
//! - The [`Email`] message description and its builder
//! - In-memory and streaming attachments
//! - The address-syntax predicate used during validation
//! - Send results and pool status snapshots

use std::fmt;
use std::path::Path;
use std::time::Duration;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::errors::{SmtpError, SmtpResult};

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .unwrap_or_else(|e| panic!("address pattern must compile: {}", e))
});

/// Returns true if `address` is a syntactically acceptable mailbox.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address)
}

/// Content type of the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    /// `text/plain`
    #[serde(rename = "text/plain")]
    TextPlain,
    /// `text/html`
    #[default]
    #[serde(rename = "text/html")]
    TextHtml,
    /// `text/markdown`
    #[serde(rename = "text/markdown")]
    TextMarkdown,
}

impl ContentType {
    /// Returns the MIME type string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::TextPlain => "text/plain",
            ContentType::TextHtml => "text/html",
            ContentType::TextMarkdown => "text/markdown",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content disposition for attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentDisposition {
    /// Regular attachment.
    #[default]
    Attachment,
    /// Inline content.
    Inline,
}

impl fmt::Display for ContentDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentDisposition::Attachment => write!(f, "attachment"),
            ContentDisposition::Inline => write!(f, "inline"),
        }
    }
}

/// Attachment held fully in memory.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Binary content.
    pub data: Vec<u8>,
    /// Content disposition (attachment or inline).
    pub disposition: ContentDisposition,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
            disposition: ContentDisposition::Attachment,
        }
    }

    /// Creates an attachment with the content type guessed from the filename.
    pub fn from_bytes(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = guess_content_type(&filename);
        Self::new(filename, content_type, data)
    }

    /// Reads a file into memory as an attachment.
    pub async fn from_path(path: impl AsRef<Path>) -> SmtpResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| {
            SmtpError::build(format!("Failed to read attachment {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Ok(Self::from_bytes(file_name(path), data))
    }

    /// Sets the content disposition to inline.
    pub fn inline(mut self) -> Self {
        self.disposition = ContentDisposition::Inline;
        self
    }
}

/// Attachment whose bytes are pulled from a reader while the message is
/// transmitted.
///
/// The payload is never buffered as a whole; memory use is bounded by the
/// encoder's chunk size regardless of the source length.
pub struct StreamAttachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Byte source.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Size hint in bytes, if known.
    pub size: Option<u64>,
}

impl StreamAttachment {
    /// Creates a streaming attachment from any async reader.
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            reader: Box::new(reader),
            size: None,
        }
    }

    /// Sets the size hint.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Opens a file for streaming, guessing its content type.
    pub async fn open(path: impl AsRef<Path>) -> SmtpResult<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            SmtpError::build(format!("Failed to open attachment {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        let size = file.metadata().await.ok().map(|m| m.len());
        let name = file_name(path);
        let content_type = guess_content_type(&name);

        let mut attachment = Self::new(name, content_type, file);
        attachment.size = size;
        Ok(attachment)
    }
}

impl fmt::Debug for StreamAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAttachment")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn guess_content_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

/// One message to dispatch.
///
/// Fields are plain strings so that a malformed message can be described and
/// rejected by [`Email::validate`] rather than by the builder.
#[derive(Debug, Default)]
pub struct Email {
    /// Sender address.
    pub from: String,
    /// Sender display name.
    pub from_name: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// CC recipients.
    pub cc: Vec<String>,
    /// BCC recipients. Listed in the envelope and the `Bcc` header.
    pub bcc: Vec<String>,
    /// Subject.
    pub subject: String,
    /// Body content.
    pub content: String,
    /// Body content type.
    pub content_type: ContentType,
    /// In-memory attachments.
    pub attachments: Vec<Attachment>,
    /// Streaming attachments.
    pub stream_attachments: Vec<StreamAttachment>,
}

impl Email {
    /// Creates a new email builder.
    pub fn builder() -> EmailBuilder {
        EmailBuilder::default()
    }

    /// Checks required fields and address syntax, reporting the first
    /// violation.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.from.trim().is_empty() {
            return Err(SmtpError::validation("Sender address is required"));
        }
        if self.from_name.trim().is_empty() {
            return Err(SmtpError::validation("Sender name is required"));
        }
        if self.subject.is_empty() {
            return Err(SmtpError::validation("Subject is required"));
        }
        if self.content.is_empty() {
            return Err(SmtpError::validation("Content is required"));
        }
        if self.to.is_empty() {
            return Err(SmtpError::validation("At least one recipient is required"));
        }

        let fields = std::iter::once(("From", &self.from))
            .chain(self.to.iter().map(|a| ("To", a)))
            .chain(self.cc.iter().map(|a| ("Cc", a)))
            .chain(self.bcc.iter().map(|a| ("Bcc", a)));
        for (field, address) in fields {
            if !is_valid_address(address) {
                return Err(SmtpError::validation(format!(
                    "Invalid {} address: {}",
                    field, address
                )));
            }
        }

        Ok(())
    }

    /// Returns the envelope: sender plus recipients in To, Cc, Bcc order.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            from: self.from.clone(),
            recipients: self
                .to
                .iter()
                .chain(self.cc.iter())
                .chain(self.bcc.iter())
                .cloned()
                .collect(),
        }
    }

    /// Returns true if the message needs more than a body part.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty() || !self.stream_attachments.is_empty()
    }
}

/// Builder for [`Email`].
#[derive(Debug, Default)]
pub struct EmailBuilder {
    email: Email,
}

impl EmailBuilder {
    /// Sets the sender address and display name.
    pub fn from(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.email.from_name = name.into();
        self.email.from = address.into();
        self
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.email.to.push(address.into());
        self
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.email.cc.push(address.into());
        self
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.email.bcc.push(address.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.email.subject = subject.into();
        self
    }

    /// Sets the body content.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.email.content = content.into();
        self
    }

    /// Sets the body content type.
    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.email.content_type = content_type;
        self
    }

    /// Adds an in-memory attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.email.attachments.push(attachment);
        self
    }

    /// Adds a streaming attachment.
    pub fn stream_attachment(mut self, attachment: StreamAttachment) -> Self {
        self.email.stream_attachments.push(attachment);
        self
    }

    /// Finishes the builder. Validation happens at send time.
    pub fn build(self) -> Email {
        self.email
    }
}

/// SMTP envelope for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `MAIL FROM` address.
    pub from: String,
    /// `RCPT TO` addresses, To then Cc then Bcc.
    pub recipients: Vec<String>,
}

/// Result of sending a single email.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Client-generated message ID.
    pub message_id: String,
    /// Recipients accepted by the server.
    pub accepted: Vec<String>,
    /// Final server reply to the message data.
    pub response: String,
    /// Id of the pooled session that carried the message.
    pub session_id: u64,
    /// Send duration, including any rate-limit wait.
    pub duration: Duration,
}

/// Connection pool status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Nominal capacity.
    pub capacity: usize,
    /// Idle sessions in the inventory.
    pub idle: usize,
    /// Sessions currently borrowed by callers.
    pub outstanding: usize,
    /// Sessions opened over the pool's lifetime.
    pub created: u64,
    /// Sessions closed on release (overflow, broken, or pool closed).
    pub discarded: u64,
    /// Whether the pool has been closed.
    pub closed: bool,
}
