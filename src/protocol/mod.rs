//! SMTP wire protocol: commands, replies and ESMTP capabilities.
//!
//! Covers the subset of RFC 5321 the dispatcher drives: greeting, EHLO/HELO,
//! STARTTLS, AUTH, the mail transaction and QUIT.

use std::collections::HashSet;
use std::fmt;

use crate::errors::{
    ConnectStage, EnhancedStatusCode, SmtpError, SmtpResult, TransactionStage,
};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, without angle brackets.
        address: String,
        /// SIZE parameter, sent only when the server advertises SIZE.
        size: Option<usize>,
    },
    /// RCPT TO command.
    RcptTo(String),
    /// DATA command.
    Data,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(response) => format!("AUTH {} {}", mechanism, response),
                None => format!("AUTH {}", mechanism),
            },
            SmtpCommand::MailFrom { address, size } => match size {
                Some(size) => format!("MAIL FROM:<{}> SIZE={}", address, size),
                None => format!("MAIL FROM:<{}>", address),
            },
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns the command verb, safe to log (no credentials).
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::Helo(_) => "HELO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth { .. } => "AUTH",
            SmtpCommand::MailFrom { .. } => "MAIL",
            SmtpCommand::RcptTo(_) => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Quit => "QUIT",
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {} ***", mechanism),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

/// SMTP reply from the server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from its raw lines (CRLF already stripped).
    ///
    /// Every line must carry the same three-digit code; all but the last use
    /// `-` as separator.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        let first = lines
            .first()
            .ok_or_else(|| SmtpError::invalid_response("Empty response"))?;
        let code = Self::line_code(first)?;
        let mut messages = Vec::with_capacity(lines.len());
        let mut enhanced_code = None;

        for (i, line) in lines.iter().enumerate() {
            if Self::line_code(line)? != code {
                return Err(SmtpError::invalid_response(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = Self::parse_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    messages.push(rest.trim().to_string());
                    continue;
                }
            }
            messages.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
        })
    }

    /// Reads the status code of a reply line and reports whether more lines
    /// follow.
    pub fn line_is_last(line: &str) -> SmtpResult<bool> {
        Self::line_code(line)?;
        match line.as_bytes().get(3) {
            None | Some(b' ') => Ok(true),
            Some(b'-') => Ok(false),
            Some(_) => Err(SmtpError::invalid_response(format!(
                "Invalid reply separator: {}",
                line
            ))),
        }
    }

    fn line_code(line: &str) -> SmtpResult<u16> {
        line.get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| SmtpError::invalid_response(format!("Invalid status code: {}", line)))
    }

    fn parse_enhanced_code(msg: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = msg.split_once(' ').unwrap_or((msg, ""));
        Some((EnhancedStatusCode::parse(head)?, rest))
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts a rejection during a mail transaction into an error.
    pub fn to_error(&self, stage: TransactionStage) -> SmtpError {
        SmtpError::protocol(stage, self.code, self.full_message())
            .with_enhanced_code(self.enhanced_code.clone())
    }

    /// Converts a rejection during session setup into an error.
    pub fn to_connect_error(&self, stage: ConnectStage) -> SmtpError {
        SmtpError::connection(stage, self.full_message())
            .with_smtp_code(self.code)
            .with_enhanced_code(self.enhanced_code.clone())
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Advertised authentication mechanisms, upper-cased.
    pub auth_mechanisms: HashSet<String>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// Raw capability strings.
    pub raw: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the
    /// server's greeting and carries no capability.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.parse().ok().filter(|s| *s > 0),
                // AUTH=PLAIN is the pre-RFC 4954 spelling
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().map(str::to_string)),
                c if c.starts_with("AUTH=") => caps
                    .auth_mechanisms
                    .extend(c[5..].split_whitespace().map(str::to_string)),
                "STARTTLS" => caps.starttls = true,
                _ => {}
            }
            caps.raw.push(line);
        }

        caps
    }

    /// Returns true if the server advertises the given AUTH mechanism.
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanisms.contains(&mechanism.to_uppercase())
    }
}

/// Position of a session within the SMTP dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connected, greeting not yet read.
    Connected,
    /// EHLO/HELO accepted.
    Greeted,
    /// Authenticated, ready for a mail transaction.
    Authenticated,
    /// After MAIL FROM.
    InTransaction,
    /// After at least one RCPT TO.
    RecipientsAdded,
    /// After DATA, until the terminating dot is acknowledged.
    SendingData,
    /// Connection closed.
    Closed,
}

impl TransactionState {
    /// Returns true if MAIL FROM is allowed in this state.
    pub fn can_start_mail(&self) -> bool {
        matches!(self, TransactionState::Greeted | TransactionState::Authenticated)
    }

    /// Returns true if RCPT TO is allowed in this state.
    pub fn can_add_recipient(&self) -> bool {
        matches!(
            self,
            TransactionState::InTransaction | TransactionState::RecipientsAdded
        )
    }

    /// Returns true if DATA is allowed in this state.
    pub fn can_send_data(&self) -> bool {
        matches!(self, TransactionState::RecipientsAdded)
    }
}

/// Reply codes the dispatcher checks for.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// User not local, will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Command not recognized (EHLO on an old server).
    pub const SYNTAX_ERROR: u16 = 500;
    /// Command not implemented.
    pub const NOT_IMPLEMENTED: u16 = 502;
}
