//! Test doubles.
//!
//! - [`MockTransport`]: in-memory scripted server behind the
//!   [`SmtpTransport`] seam, replying per command verb.
//! - [`MockConnectionFactory`]: hands out sessions over mock transports.
//! - [`MockSmtpServer`]: a minimal SMTP server on a loopback socket for
//!   end-to-end tests through the real transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::auth::Credentials;
use crate::config::{RateLimitConfig, SmtpConfig, TemplateConfig, TlsConfig};
use crate::connector::ConnectionFactory;
use crate::errors::{ConnectStage, SmtpError, SmtpResult};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::session::Session;
use crate::transport::{SmtpTransport, TlsConnector};
use crate::types::Email;

/// Key for the reply read after the server greeting is due.
pub const GREETING: &str = "GREETING";
/// Key for the reply to the terminating dot of a message.
pub const END_OF_DATA: &str = "END";

/// Canned server reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    code: u16,
    lines: Vec<String>,
}

impl MockReply {
    /// Single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![message.into()],
        }
    }

    /// Multi-line reply.
    pub fn multiline(code: u16, lines: &[&str]) -> Self {
        Self {
            code,
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn to_response(&self) -> SmtpResponse {
        let lines: Vec<String> = self
            .lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let sep = if i + 1 == self.lines.len() { ' ' } else { '-' };
                format!("{}{}{}", self.code, sep, line)
            })
            .collect();
        SmtpResponse::parse(&lines).unwrap_or_else(|_| SmtpResponse::new(self.code, self.lines.join(" ")))
    }
}

#[derive(Debug, Default)]
struct JournalInner {
    commands: Vec<String>,
    data: Vec<u8>,
    closed: usize,
}

/// Record of what mock transports saw, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MockJournal(Arc<Mutex<JournalInner>>);

impl MockJournal {
    /// Commands in wire form, without CRLF.
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().commands.clone()
    }

    /// Returns how many times `verb` was sent.
    pub fn count(&self, verb: &str) -> usize {
        self.0
            .lock()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    /// Raw bytes written after DATA, dot-stuffed as sent.
    pub fn data(&self) -> Vec<u8> {
        self.0.lock().data.clone()
    }

    /// Number of transports closed.
    pub fn closed(&self) -> usize {
        self.0.lock().closed
    }
}

fn default_replies() -> HashMap<String, MockReply> {
    let mut replies = HashMap::new();
    replies.insert(GREETING.to_string(), MockReply::new(codes::SERVICE_READY, "mock.server ESMTP ready"));
    replies.insert(
        "EHLO".to_string(),
        MockReply::multiline(codes::OK, &["mock.server", "SIZE 10485760", "AUTH PLAIN", "8BITMIME"]),
    );
    replies.insert("HELO".to_string(), MockReply::new(codes::OK, "mock.server"));
    replies.insert("STARTTLS".to_string(), MockReply::new(codes::SERVICE_READY, "2.0.0 Ready to start TLS"));
    replies.insert("AUTH".to_string(), MockReply::new(codes::AUTH_SUCCESS, "2.7.0 Authentication successful"));
    replies.insert("MAIL".to_string(), MockReply::new(codes::OK, "2.1.0 Ok"));
    replies.insert("RCPT".to_string(), MockReply::new(codes::OK, "2.1.5 Ok"));
    replies.insert("DATA".to_string(), MockReply::new(codes::START_MAIL_INPUT, "End data with <CR><LF>.<CR><LF>"));
    replies.insert("QUIT".to_string(), MockReply::new(codes::SERVICE_CLOSING, "2.0.0 Bye"));
    replies.insert(END_OF_DATA.to_string(), MockReply::new(codes::OK, "2.0.0 Ok: queued"));
    replies
}

/// Scripted in-memory transport.
#[derive(Debug)]
pub struct MockTransport {
    journal: MockJournal,
    replies: HashMap<String, MockReply>,
    pending: VecDeque<SmtpResponse>,
    fail_on: Option<String>,
    tls: bool,
    closed: bool,
}

impl MockTransport {
    /// Creates a transport whose server accepts everything.
    pub fn new() -> Self {
        Self::with_journal(MockJournal::default())
    }

    /// Creates a transport recording into an existing journal.
    pub fn with_journal(journal: MockJournal) -> Self {
        let replies = default_replies();
        let greeting = replies[GREETING].to_response();
        Self {
            journal,
            replies,
            pending: VecDeque::from([greeting]),
            fail_on: None,
            tls: false,
            closed: false,
        }
    }

    /// Overrides the reply to `verb` ([`GREETING`] and [`END_OF_DATA`]
    /// included).
    pub fn with_reply(mut self, verb: &str, reply: MockReply) -> Self {
        if verb == GREETING {
            self.pending = VecDeque::from([reply.to_response()]);
        }
        self.replies.insert(verb.to_string(), reply);
        self
    }

    /// Makes the next `verb` (or `"BODY"` for data writes) fail with an I/O
    /// error, as if the connection dropped.
    pub fn fail_on(mut self, verb: &str) -> Self {
        self.fail_on = Some(verb.to_string());
        self
    }

    /// Returns the shared journal.
    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }

    fn check(&mut self, verb: &str) -> SmtpResult<()> {
        if self.closed {
            return Err(SmtpError::io("Transport is closed"));
        }
        if self.fail_on.as_deref() == Some(verb) {
            self.fail_on = None;
            self.closed = true;
            return Err(SmtpError::io("Connection reset by peer"));
        }
        Ok(())
    }

    fn reply(&self, key: &str) -> SmtpResponse {
        self.replies
            .get(key)
            .map(MockReply::to_response)
            .unwrap_or_else(|| SmtpResponse::new(codes::SYNTAX_ERROR, "5.5.1 Unrecognized command"))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SmtpTransport for MockTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.check(command.verb())?;
        self.journal.0.lock().commands.push(command.to_smtp_string());
        Ok(self.reply(command.verb()))
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.check("BODY")?;
        self.journal.0.lock().data.extend_from_slice(data);
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        if self.closed {
            return Err(SmtpError::io("Transport is closed"));
        }
        Ok(self
            .pending
            .pop_front()
            .unwrap_or_else(|| self.reply(END_OF_DATA)))
    }

    async fn upgrade_tls(&mut self, _connector: &TlsConnector) -> SmtpResult<()> {
        self.check("TLS")?;
        self.tls = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
        }
        self.journal.0.lock().closed += 1;
    }
}

/// Connection factory producing authenticated sessions over mock
/// transports that share one journal.
#[derive(Debug, Default)]
pub struct MockConnectionFactory {
    journal: MockJournal,
    attempts: AtomicUsize,
    fail_after: Option<usize>,
    overrides: Vec<(String, MockReply)>,
    connect_delay: Option<Duration>,
}

impl MockConnectionFactory {
    /// Creates a factory whose sessions accept everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeeds for the first `n` connects, then fails at the dial stage.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Overrides a reply on every transport this factory creates.
    pub fn with_reply(mut self, verb: &str, reply: MockReply) -> Self {
        self.overrides.push((verb.to_string(), reply));
        self
    }

    /// Delays each connect, to widen race windows in tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Returns the number of connect attempts.
    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the journal shared by all transports.
    pub fn journal(&self) -> MockJournal {
        self.journal.clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self) -> SmtpResult<Session> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_after.is_some_and(|limit| attempt >= limit) {
            return Err(SmtpError::connection(ConnectStage::Dial, "Connection refused (mock)"));
        }

        let mut transport = MockTransport::with_journal(self.journal.clone());
        for (verb, reply) in &self.overrides {
            transport = transport.with_reply(verb, reply.clone());
        }

        let mut session = Session::new(Box::new(transport));
        session.read_greeting().await?;
        session.hello("mock.client").await?;
        session.authenticate(&test_credentials(), "localhost").await?;
        Ok(session)
    }
}

#[derive(Debug, Default)]
struct ServerState {
    commands: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
struct ServerBehavior {
    reject_auth: bool,
    rejected_recipients: HashSet<String>,
    stall_end_of_data: bool,
}

/// Builder for [`MockSmtpServer`].
#[derive(Debug, Default)]
pub struct MockSmtpServerBuilder {
    behavior: ServerBehavior,
}

impl MockSmtpServerBuilder {
    /// Answers AUTH with 535.
    pub fn reject_auth(mut self) -> Self {
        self.behavior.reject_auth = true;
        self
    }

    /// Answers `RCPT TO:<address>` with 550.
    pub fn reject_recipient(mut self, address: impl Into<String>) -> Self {
        self.behavior.rejected_recipients.insert(address.into());
        self
    }

    /// Never answers the terminating dot of a message.
    pub fn stall_end_of_data(mut self) -> Self {
        self.behavior.stall_end_of_data = true;
        self
    }

    /// Binds to an ephemeral loopback port and starts accepting.
    ///
    /// # Panics
    ///
    /// Panics if the loopback listener cannot be bound.
    pub async fn start(self) -> MockSmtpServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|e| panic!("failed to bind mock server: {}", e));
        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|e| panic!("mock server has no address: {}", e));

        let state = Arc::new(ServerState::default());
        let behavior = Arc::new(self.behavior);
        let accept_state = state.clone();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state, behavior).await;
                });
            }
        });

        MockSmtpServer {
            local_addr,
            address: local_addr.to_string(),
            state,
            task,
        }
    }
}

/// Loopback SMTP server for end-to-end tests.
#[derive(Debug)]
pub struct MockSmtpServer {
    local_addr: SocketAddr,
    address: String,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl MockSmtpServer {
    /// Starts a server that accepts everything.
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    /// Returns a builder for a server with custom behaviour.
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    /// Returns `host:port`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the listening port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Commands received across all connections, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    /// Returns how many received commands start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Message payloads received, with dot-stuffing removed.
    pub fn messages(&self) -> Vec<String> {
        self.state.messages.lock().clone()
    }

    /// Number of accepted TCP connections.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    behavior: Arc<ServerBehavior>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"220 mock.server ESMTP ready\r\n").await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        state.commands.lock().push(command.clone());
        let verb = command
            .split([' ', ':'])
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        let reply: &[u8] = match verb.as_str() {
            "EHLO" => b"250-mock.server\r\n250-SIZE 10485760\r\n250 AUTH PLAIN\r\n",
            "HELO" => b"250 mock.server\r\n",
            "AUTH" if behavior.reject_auth => b"535 5.7.8 Authentication credentials invalid\r\n",
            "AUTH" => b"235 2.7.0 Authentication successful\r\n",
            "MAIL" => b"250 2.1.0 Ok\r\n",
            "RCPT" => {
                let address = command
                    .split_once('<')
                    .and_then(|(_, rest)| rest.split_once('>'))
                    .map(|(addr, _)| addr)
                    .unwrap_or_default();
                if behavior.rejected_recipients.contains(address) {
                    b"550 5.1.1 Recipient address rejected\r\n"
                } else {
                    b"250 2.1.5 Ok\r\n"
                }
            }
            "DATA" => {
                writer.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;
                let message = read_message(&mut reader).await?;
                state.messages.lock().push(message);
                if behavior.stall_end_of_data {
                    // Hold the connection open without answering.
                    std::future::pending::<()>().await;
                }
                b"250 2.0.0 Ok: queued\r\n"
            }
            "QUIT" => {
                writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                return Ok(());
            }
            _ => b"502 5.5.1 Command not implemented\r\n",
        };
        writer.write_all(reply).await?;
    }
}

async fn read_message<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<String> {
    let mut message = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(message);
        }
        let content = line.trim_end_matches(['\r', '\n']);
        if content == "." {
            return Ok(message);
        }
        // A leading dot is always transparency padding.
        let content = content.strip_prefix('.').unwrap_or(content);
        message.push_str(content);
        message.push_str("\r\n");
    }
}

/// Credentials accepted by every mock.
pub fn test_credentials() -> Credentials {
    Credentials::new("user", SecretString::new("pass".to_string()))
}

/// Configuration pointing at `address` (`host:port`) with short timeouts.
///
/// # Panics
///
/// Panics if `address` has no numeric port.
pub fn test_config(address: &str) -> SmtpConfig {
    let (host, port) = address
        .rsplit_once(':')
        .and_then(|(h, p)| Some((h, p.parse::<u16>().ok()?)))
        .unwrap_or_else(|| panic!("address must be host:port, got {}", address));

    SmtpConfig {
        host: host.to_string(),
        port,
        username: "user".to_string(),
        password: Some(SecretString::new("pass".to_string())),
        tls: TlsConfig::default(),
        connect_timeout: Duration::from_secs(2),
        keep_alive: Duration::from_secs(10),
        command_timeout: Duration::from_secs(2),
        pool_size: 2,
        rate_limit: RateLimitConfig::default(),
        templates: TemplateConfig::default(),
        client_id: Some("test.client".to_string()),
    }
}

/// Minimal valid email: `a@x.com` to `b@x.com`, subject `S`, content `C`.
pub fn test_email() -> Email {
    Email::builder()
        .from("Sender", "a@x.com")
        .to("b@x.com")
        .subject("S")
        .content("C")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_scripted_replies() {
        let mut transport = MockTransport::new().with_reply("MAIL", MockReply::new(451, "try later"));
        let greeting = transport.read_response().await.unwrap();
        assert_eq!(greeting.code, 220);

        let ehlo = transport
            .send_command(&SmtpCommand::Ehlo("me".to_string()))
            .await
            .unwrap();
        assert_eq!(ehlo.code, 250);
        assert_eq!(ehlo.message.len(), 4);

        let mail = transport
            .send_command(&SmtpCommand::MailFrom {
                address: "a@x.com".to_string(),
                size: None,
            })
            .await
            .unwrap();
        assert_eq!(mail.code, 451);
    }

    #[tokio::test]
    async fn test_mock_transport_failure_closes() {
        let mut transport = MockTransport::new().fail_on("RCPT");
        let err = transport
            .send_command(&SmtpCommand::RcptTo("b@x.com".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::SmtpErrorKind::Io);
        assert!(transport.send_command(&SmtpCommand::Quit).await.is_err());
    }

    #[tokio::test]
    async fn test_server_unstuffs_data() {
        let server = MockSmtpServer::start().await;
        let stream = TcpStream::connect(server.address()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220"));

        writer.write_all(b"DATA\r\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("354"));

        writer
            .write_all(b"hello\r\n..dot\r\n.unstuffed\r\n...\r\n.\r\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"));
        assert_eq!(
            server.messages(),
            vec!["hello\r\n.dot\r\nunstuffed\r\n..\r\n".to_string()]
        );
    }

    #[test]
    fn test_config_parses_address() {
        let config = test_config("127.0.0.1:2525");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 2525);
        assert!(config.validate().is_ok());
    }
}
