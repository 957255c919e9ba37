//! Error types for the dispatch client.
//!
//! Every failure is reported as an [`SmtpError`] whose [`SmtpErrorKind`]
//! places it in the dispatch taxonomy: validation, connection (tagged by the
//! stage that failed), protocol (tagged by the transaction stage), message
//! building, template rendering, plus a handful of operational kinds.

use std::fmt;
use thiserror::Error;

/// Result type for dispatch operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Stage of session establishment at which a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStage {
    /// TCP dial (including the connect timeout).
    Dial,
    /// Server greeting or EHLO/HELO exchange.
    Greeting,
    /// Direct TLS handshake or STARTTLS upgrade.
    Tls,
    /// Credential exchange.
    Auth,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectStage::Dial => write!(f, "dial"),
            ConnectStage::Greeting => write!(f, "greeting"),
            ConnectStage::Tls => write!(f, "tls"),
            ConnectStage::Auth => write!(f, "auth"),
        }
    }
}

/// Stage of a mail transaction at which the server (or the stream) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStage {
    /// `MAIL FROM` envelope sender.
    MailFrom,
    /// `RCPT TO` for one recipient.
    RcptTo,
    /// `DATA` command.
    Data,
    /// Streaming the message body.
    Body,
    /// Final reply after the terminating dot.
    EndOfData,
    /// `QUIT`.
    Quit,
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStage::MailFrom => write!(f, "MAIL FROM"),
            TransactionStage::RcptTo => write!(f, "RCPT TO"),
            TransactionStage::Data => write!(f, "DATA"),
            TransactionStage::Body => write!(f, "message body"),
            TransactionStage::EndOfData => write!(f, "end of data"),
            TransactionStage::Quit => write!(f, "QUIT"),
        }
    }
}

/// Error kinds categorizing dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    /// A required field is empty or an address is malformed.
    Validation,
    /// Session establishment failed at the given stage.
    Connection(ConnectStage),
    /// The server rejected a command mid-transaction.
    Protocol(TransactionStage),
    /// The server sent a reply that could not be parsed.
    InvalidResponse,
    /// Assembling or streaming the MIME payload failed.
    Build,
    /// Loading, compiling or executing a template failed.
    Template,
    /// A network read or write exceeded its deadline.
    Timeout,
    /// The connection pool has been closed.
    PoolClosed,
    /// An asynchronous send was cancelled before it completed.
    Cancelled,
    /// Configuration is invalid.
    Configuration,
    /// Underlying I/O failure outside a more specific stage.
    Io,
}

impl SmtpErrorKind {
    /// Returns true if repeating the operation could plausibly succeed.
    ///
    /// Nothing in this crate retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::Connection(ConnectStage::Dial)
                | SmtpErrorKind::Connection(ConnectStage::Greeting)
                | SmtpErrorKind::Timeout
                | SmtpErrorKind::Io
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::Validation => write!(f, "Validation failed"),
            SmtpErrorKind::Connection(stage) => write!(f, "Connection failed at {}", stage),
            SmtpErrorKind::Protocol(stage) => write!(f, "Server rejected {}", stage),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::Build => write!(f, "Message build failed"),
            SmtpErrorKind::Template => write!(f, "Template error"),
            SmtpErrorKind::Timeout => write!(f, "Timed out"),
            SmtpErrorKind::PoolClosed => write!(f, "Connection pool closed"),
            SmtpErrorKind::Cancelled => write!(f, "Send cancelled"),
            SmtpErrorKind::Configuration => write!(f, "Invalid configuration"),
            SmtpErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let code = Self {
            class: parts.next()?.parse().ok()?,
            subject: parts.next()?.parse().ok()?,
            detail: parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() || !(2..=5).contains(&code.class) {
            return None;
        }
        Some(code)
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Dispatch error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: Option<EnhancedStatusCode>) -> Self {
        self.enhanced_code = code;
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if the error came from a server reply.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return (400..500).contains(&code);
        }
        self.kind.is_retryable()
    }

    /// Re-tags a connection error with the stage it occurred in.
    ///
    /// Timeouts and I/O errors raised by the transport carry no stage; the
    /// caller knows which one it was driving.
    pub fn at_connect_stage(mut self, stage: ConnectStage) -> Self {
        if !matches!(self.kind, SmtpErrorKind::Connection(_)) {
            self.message = format!("{} ({})", self.message, self.kind);
        }
        self.kind = SmtpErrorKind::Connection(stage);
        self
    }

    // Convenience constructors

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Validation, message)
    }

    /// Creates a connection error tagged with its stage.
    pub fn connection(stage: ConnectStage, message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Connection(stage), message)
    }

    /// Creates a protocol error for a rejected transaction step.
    pub fn protocol(stage: TransactionStage, code: u16, message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Protocol(stage), message).with_smtp_code(code)
    }

    /// Creates an error for an unparseable server reply.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a message build error.
    pub fn build(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Build, message)
    }

    /// Creates a template error.
    pub fn template(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Template, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Timeout, message)
    }

    /// Creates a pool closed error.
    pub fn pool_closed() -> Self {
        Self::new(SmtpErrorKind::PoolClosed, "Connection pool has been closed")
    }

    /// Creates a cancellation error.
    pub fn cancelled() -> Self {
        Self::new(SmtpErrorKind::Cancelled, "Send was cancelled before completion")
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Configuration, message)
    }

    /// Creates an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Io, message)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for SmtpError {
    fn from(err: std::io::Error) -> Self {
        SmtpError::io(err.to_string()).with_cause(err)
    }
}

impl From<tokio::time::error::Elapsed> for SmtpError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SmtpError::timeout("Operation exceeded its deadline").with_cause(err)
    }
}

impl From<minijinja::Error> for SmtpError {
    fn from(err: minijinja::Error) -> Self {
        SmtpError::template(err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_names_stage() {
        let kind = SmtpErrorKind::Connection(ConnectStage::Auth);
        assert_eq!(kind.to_string(), "Connection failed at auth");

        let kind = SmtpErrorKind::Protocol(TransactionStage::RcptTo);
        assert_eq!(kind.to_string(), "Server rejected RCPT TO");
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code, EnhancedStatusCode::new(5, 1, 1));
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("5.1").is_none());
        assert!(EnhancedStatusCode::parse("5.1.1.1").is_none());
        assert!(EnhancedStatusCode::parse("9.1.1").is_none());
        assert!(EnhancedStatusCode::parse("hello").is_none());
    }

    #[test]
    fn test_protocol_error_carries_code() {
        let err = SmtpError::protocol(TransactionStage::RcptTo, 550, "no such user");
        assert_eq!(
            err.kind(),
            SmtpErrorKind::Protocol(TransactionStage::RcptTo)
        );
        assert_eq!(err.smtp_code(), Some(550));
        assert!(!err.is_retryable());

        let err = SmtpError::protocol(TransactionStage::MailFrom, 451, "try later");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_at_connect_stage_retags_timeout() {
        let err = SmtpError::timeout("read timed out").at_connect_stage(ConnectStage::Tls);
        assert_eq!(err.kind(), SmtpErrorKind::Connection(ConnectStage::Tls));
        assert!(err.message().contains("read timed out"));
    }

    #[test]
    fn test_display_includes_codes() {
        let err = SmtpError::protocol(TransactionStage::Data, 554, "rejected")
            .with_enhanced_code(EnhancedStatusCode::parse("5.7.1"));
        assert_eq!(
            err.to_string(),
            "Server rejected DATA: rejected (SMTP 554) [5.7.1]"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: SmtpError = io.into();
        assert_eq!(err.kind(), SmtpErrorKind::Io);
        assert!(err.is_retryable());
    }
}
