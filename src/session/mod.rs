//! Authenticated SMTP sessions.
//!
//! A [`Session`] wraps one transport and tracks where it is in the SMTP
//! dialogue. Ownership stands in for the pool states: a session inside the
//! pool inventory is idle, a session held by a caller is borrowed, and
//! [`Session::quit`] consumes it.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::auth::{Authenticator, Credentials, PLAIN};
use crate::errors::{ConnectStage, SmtpError, SmtpResult, TransactionStage};
use crate::mime::BodySink;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse, TransactionState};
use crate::transport::{SmtpTransport, TlsConnector};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes buffered by [`DataStream`] before they are written out.
const DATA_FLUSH_THRESHOLD: usize = 16 * 1024;

/// Whether a session may carry another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// Ready for reuse.
    Healthy,
    /// A transaction failed on this session; it must be closed, not pooled.
    Broken,
}

/// One SMTP conversation with a server.
pub struct Session {
    id: u64,
    transport: Box<dyn SmtpTransport>,
    state: TransactionState,
    ready_state: TransactionState,
    capabilities: EsmtpCapabilities,
    health: SessionHealth,
    created_at: Instant,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("health", &self.health)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Session {
    /// Wraps a freshly connected transport.
    pub fn new(transport: Box<dyn SmtpTransport>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            state: TransactionState::Connected,
            ready_state: TransactionState::Greeted,
            capabilities: EsmtpCapabilities::default(),
            health: SessionHealth::Healthy,
            created_at: Instant::now(),
        }
    }

    /// Returns the process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current dialogue state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the session health.
    pub fn health(&self) -> SessionHealth {
        self.health
    }

    /// Flags the session so the pool closes it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.health = SessionHealth::Broken;
    }

    /// Returns true if the session is healthy and between transactions.
    pub fn is_reusable(&self) -> bool {
        self.health == SessionHealth::Healthy && self.state.can_start_mail()
    }

    /// Returns the capabilities from the most recent EHLO.
    pub fn capabilities(&self) -> &EsmtpCapabilities {
        &self.capabilities
    }

    /// Returns true if the transport is encrypted.
    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Returns how long ago the session was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    async fn command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let result = self.transport.send_command(command).await;
        if result.is_err() {
            self.mark_broken();
        }
        result
    }

    /// Reads the server greeting.
    pub async fn read_greeting(&mut self) -> SmtpResult<SmtpResponse> {
        let response = self
            .transport
            .read_response()
            .await
            .map_err(|e| e.at_connect_stage(ConnectStage::Greeting))?;
        if response.code != codes::SERVICE_READY {
            return Err(response.to_connect_error(ConnectStage::Greeting));
        }
        Ok(response)
    }

    /// Introduces the client with EHLO, falling back to HELO on servers that
    /// do not recognize it.
    pub async fn hello(&mut self, client_id: &str) -> SmtpResult<()> {
        let response = self
            .command(&SmtpCommand::Ehlo(client_id.to_string()))
            .await
            .map_err(|e| e.at_connect_stage(ConnectStage::Greeting))?;

        if response.is_success() {
            self.capabilities = EsmtpCapabilities::from_ehlo_response(&response);
        } else if matches!(response.code, codes::SYNTAX_ERROR | codes::NOT_IMPLEMENTED) {
            let response = self
                .command(&SmtpCommand::Helo(client_id.to_string()))
                .await
                .map_err(|e| e.at_connect_stage(ConnectStage::Greeting))?;
            if !response.is_success() {
                return Err(response.to_connect_error(ConnectStage::Greeting));
            }
            self.capabilities = EsmtpCapabilities::default();
        } else {
            return Err(response.to_connect_error(ConnectStage::Greeting));
        }

        self.state = TransactionState::Greeted;
        self.ready_state = TransactionState::Greeted;
        Ok(())
    }

    /// Upgrades the session in place with STARTTLS and greets again.
    pub async fn start_tls(&mut self, connector: &TlsConnector, client_id: &str) -> SmtpResult<()> {
        if !self.capabilities.starttls {
            return Err(SmtpError::connection(
                ConnectStage::Tls,
                "Server does not advertise STARTTLS",
            ));
        }

        let response = self
            .command(&SmtpCommand::StartTls)
            .await
            .map_err(|e| e.at_connect_stage(ConnectStage::Tls))?;
        if response.code != codes::SERVICE_READY {
            return Err(response.to_connect_error(ConnectStage::Tls));
        }

        if let Err(e) = self.transport.upgrade_tls(connector).await {
            self.mark_broken();
            return Err(e.at_connect_stage(ConnectStage::Tls));
        }

        // Capabilities learned in clear text are discarded (RFC 3207 §4.2).
        self.capabilities = EsmtpCapabilities::default();
        self.hello(client_id)
            .await
            .map_err(|e| e.at_connect_stage(ConnectStage::Tls))
    }

    /// Authenticates with AUTH PLAIN.
    ///
    /// Refused over an unencrypted transport unless `host` is loopback.
    pub async fn authenticate(&mut self, credentials: &Credentials, host: &str) -> SmtpResult<()> {
        Authenticator::check_plain_allowed(self.transport.is_tls(), host)?;

        if !self.capabilities.auth_mechanisms.is_empty() && !self.capabilities.supports_auth(PLAIN) {
            return Err(SmtpError::connection(
                ConnectStage::Auth,
                "Server does not offer AUTH PLAIN",
            ));
        }

        let command = SmtpCommand::Auth {
            mechanism: PLAIN.to_string(),
            initial_response: Some(Authenticator::plain_initial_response(credentials)),
        };
        let response = self
            .command(&command)
            .await
            .map_err(|e| e.at_connect_stage(ConnectStage::Auth))?;
        if response.code != codes::AUTH_SUCCESS {
            return Err(response.to_connect_error(ConnectStage::Auth));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(session = self.id, user = %credentials.username(), "Authenticated");

        self.state = TransactionState::Authenticated;
        self.ready_state = TransactionState::Authenticated;
        Ok(())
    }

    /// Declares the envelope sender.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> SmtpResult<()> {
        if !self.state.can_start_mail() {
            return Err(self.out_of_sequence(TransactionStage::MailFrom));
        }

        let command = SmtpCommand::MailFrom {
            address: from.to_string(),
            size: size.filter(|_| self.capabilities.size.is_some()),
        };
        let response = self.command(&command).await?;
        if !response.is_success() {
            return Err(response.to_error(TransactionStage::MailFrom));
        }

        self.state = TransactionState::InTransaction;
        Ok(())
    }

    /// Declares one recipient.
    pub async fn rcpt_to(&mut self, to: &str) -> SmtpResult<()> {
        if !self.state.can_add_recipient() {
            return Err(self.out_of_sequence(TransactionStage::RcptTo));
        }

        let response = self.command(&SmtpCommand::RcptTo(to.to_string())).await?;
        if !matches!(response.code, codes::OK | codes::WILL_FORWARD) {
            let err = response.to_error(TransactionStage::RcptTo);
            let message = format!("{} (recipient {})", err.message(), to);
            return Err(SmtpError::protocol(TransactionStage::RcptTo, response.code, message)
                .with_enhanced_code(response.enhanced_code));
        }

        self.state = TransactionState::RecipientsAdded;
        Ok(())
    }

    /// Opens the data stream. The returned stream must be finished for the
    /// session to become reusable.
    pub async fn data(&mut self) -> SmtpResult<DataStream<'_>> {
        if !self.state.can_send_data() {
            return Err(self.out_of_sequence(TransactionStage::Data));
        }

        let response = self.command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error(TransactionStage::Data));
        }

        self.state = TransactionState::SendingData;
        Ok(DataStream {
            session: self,
            buffer: Vec::with_capacity(DATA_FLUSH_THRESHOLD),
            at_line_start: true,
            bytes_written: 0,
        })
    }

    /// Closes the session.
    ///
    /// Sends QUIT when the dialogue is at a command boundary. A session
    /// stopped in the middle of DATA is dropped without QUIT, since the
    /// server would read the command as message content.
    pub async fn quit(mut self) {
        if !matches!(
            self.state,
            TransactionState::SendingData | TransactionState::Closed
        ) {
            let _ = self.transport.send_command(&SmtpCommand::Quit).await;
        }
        self.transport.close().await;
        self.state = TransactionState::Closed;

        #[cfg(feature = "tracing")]
        tracing::debug!(session = self.id, age = ?self.age(), "Session closed");
    }

    fn out_of_sequence(&mut self, stage: TransactionStage) -> SmtpError {
        self.mark_broken();
        SmtpError::new(
            crate::errors::SmtpErrorKind::Protocol(stage),
            format!("{} not allowed in state {:?}", stage, self.state),
        )
    }
}

/// Message body writer for an open DATA command.
///
/// Applies dot-stuffing incrementally, so the body can be produced in
/// chunks of any size, and appends the terminating `.` on [`finish`].
///
/// [`finish`]: DataStream::finish
pub struct DataStream<'a> {
    session: &'a mut Session,
    buffer: Vec<u8>,
    at_line_start: bool,
    bytes_written: u64,
}

impl DataStream<'_> {
    /// Returns the number of body bytes accepted so far, before stuffing.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn stuff(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.at_line_start && byte == b'.' {
                self.buffer.push(b'.');
            }
            self.buffer.push(byte);
            self.at_line_start = byte == b'\n';
        }
        self.bytes_written += chunk.len() as u64;
    }

    async fn flush_buffer(&mut self) -> SmtpResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.session.transport.send_data(&self.buffer).await;
        self.buffer.clear();
        result.map_err(|e| {
            self.session.mark_broken();
            SmtpError::new(
                crate::errors::SmtpErrorKind::Protocol(TransactionStage::Body),
                format!("Failed to stream message body: {}", e),
            )
            .with_cause(e)
        })
    }

    /// Writes the terminating dot and reads the server's verdict.
    pub async fn finish(mut self) -> SmtpResult<SmtpResponse> {
        if !self.at_line_start {
            self.buffer.extend_from_slice(b"\r\n");
        }
        self.buffer.extend_from_slice(b".\r\n");
        self.flush_buffer().await?;

        let response = match self.session.transport.read_response().await {
            Ok(response) => response,
            Err(e) => {
                self.session.mark_broken();
                return Err(e);
            }
        };

        self.session.state = self.session.ready_state;
        if !response.is_success() {
            return Err(response.to_error(TransactionStage::EndOfData));
        }
        Ok(response)
    }
}

#[async_trait]
impl BodySink for DataStream<'_> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> SmtpResult<()> {
        self.stuff(chunk);
        if self.buffer.len() >= DATA_FLUSH_THRESHOLD {
            self.flush_buffer().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;
    use crate::mocks::{MockReply, MockTransport};
    use secrecy::SecretString;

    fn credentials() -> Credentials {
        Credentials::new("user", SecretString::new("pass".to_string()))
    }

    async fn ready_session(mock: MockTransport) -> Session {
        let mut session = Session::new(Box::new(mock));
        session.read_greeting().await.unwrap();
        session.hello("client").await.unwrap();
        session.authenticate(&credentials(), "127.0.0.1").await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let mock = MockTransport::new();
        let journal = mock.journal();
        let mut session = ready_session(mock).await;

        session.mail_from("a@x.com", None).await.unwrap();
        session.rcpt_to("b@x.com").await.unwrap();
        let mut data = session.data().await.unwrap();
        data.write_chunk(b"Subject: S\r\n\r\nC").await.unwrap();
        let response = data.finish().await.unwrap();
        assert_eq!(response.code, 250);
        assert!(session.is_reusable());

        let commands = journal.commands();
        assert_eq!(
            commands,
            vec![
                "EHLO client",
                "AUTH PLAIN AHVzZXIAcGFzcw==",
                "MAIL FROM:<a@x.com>",
                "RCPT TO:<b@x.com>",
                "DATA",
            ]
        );
        assert_eq!(journal.data(), b"Subject: S\r\n\r\nC\r\n.\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_dot_stuffing_across_chunks() {
        let mock = MockTransport::new();
        let journal = mock.journal();
        let mut session = ready_session(mock).await;

        session.mail_from("a@x.com", None).await.unwrap();
        session.rcpt_to("b@x.com").await.unwrap();
        let mut data = session.data().await.unwrap();
        data.write_chunk(b".leading\r\nline\r").await.unwrap();
        data.write_chunk(b"\n.").await.unwrap();
        data.write_chunk(b".dots\r\n").await.unwrap();
        assert_eq!(data.bytes_written(), 24);
        data.finish().await.unwrap();

        assert_eq!(journal.data(), b"..leading\r\nline\r\n...dots\r\n.\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_rejected_recipient_names_stage() {
        let mock = MockTransport::new().with_reply("RCPT", MockReply::new(550, "5.1.1 no such user"));
        let mut session = ready_session(mock).await;

        session.mail_from("a@x.com", None).await.unwrap();
        let err = session.rcpt_to("ghost@x.com").await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Protocol(TransactionStage::RcptTo));
        assert_eq!(err.smtp_code(), Some(550));
        assert!(err.message().contains("ghost@x.com"));
        assert!(!session.is_reusable());
    }

    #[tokio::test]
    async fn test_auth_failure_is_tagged() {
        let mock = MockTransport::new().with_reply("AUTH", MockReply::new(535, "bad credentials"));
        let mut session = Session::new(Box::new(mock));
        session.read_greeting().await.unwrap();
        session.hello("client").await.unwrap();

        let err = session.authenticate(&credentials(), "localhost").await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Connection(ConnectStage::Auth));
        assert_eq!(err.smtp_code(), Some(535));
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mock = MockTransport::new().with_reply("EHLO", MockReply::new(502, "not implemented"));
        let journal = mock.journal();
        let mut session = Session::new(Box::new(mock));
        session.read_greeting().await.unwrap();
        session.hello("client").await.unwrap();

        assert_eq!(session.state(), TransactionState::Greeted);
        assert_eq!(journal.commands(), vec!["EHLO client", "HELO client"]);
    }

    #[tokio::test]
    async fn test_quit_skipped_mid_data() {
        let mock = MockTransport::new();
        let journal = mock.journal();
        let mut session = ready_session(mock).await;

        session.mail_from("a@x.com", None).await.unwrap();
        session.rcpt_to("b@x.com").await.unwrap();
        let data = session.data().await.unwrap();
        drop(data);
        assert!(!session.is_reusable());

        session.quit().await;
        assert!(!journal.commands().contains(&"QUIT".to_string()));
        assert_eq!(journal.closed(), 1);
    }

    #[tokio::test]
    async fn test_out_of_sequence_marks_broken() {
        let mut session = ready_session(MockTransport::new()).await;
        let err = session.rcpt_to("b@x.com").await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Protocol(TransactionStage::RcptTo));
        assert_eq!(session.health(), SessionHealth::Broken);
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let a = Session::new(Box::new(MockTransport::new()));
        let b = Session::new(Box::new(MockTransport::new()));
        assert_ne!(a.id(), b.id());
    }
}
