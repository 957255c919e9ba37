//! Transport layer for SMTP sessions.
//!
//! Provides the [`SmtpTransport`] abstraction the session drives, and its
//! TCP implementation with optional TLS (direct or upgraded in place).

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::TlsConfig;
use crate::errors::{ConnectStage, SmtpError, SmtpResult};
use crate::protocol::{SmtpCommand, SmtpResponse};

/// Byte-level conversation with one SMTP server.
///
/// Implementations only move commands, replies and body bytes; dialogue
/// state lives in [`crate::session::Session`].
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and receives the reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw bytes (message body after DATA).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads one reply from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Performs a TLS handshake over the current connection.
    async fn upgrade_tls(&mut self, connector: &TlsConnector) -> SmtpResult<()>;

    /// Returns true if the connection is encrypted.
    fn is_tls(&self) -> bool;

    /// Drops the underlying connection without any protocol exchange.
    async fn close(&mut self);
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(TcpStream),
    #[cfg(feature = "rustls-tls")]
    Rustls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
    NativeTls(Box<tokio_native_tls::TlsStream<TcpStream>>),
    /// Placeholder while the socket is handed to a TLS handshake, and after
    /// the transport has been closed.
    Closed,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
            TransportStream::NativeTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::Closed => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
            TransportStream::NativeTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::Closed => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
            TransportStream::NativeTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::Closed => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            TransportStream::Rustls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
            TransportStream::NativeTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// TLS client settings built once from a [`TlsConfig`] and shared by every
/// session a connector opens.
#[derive(Clone)]
pub struct TlsConnector {
    server_name: String,
    handshake_timeout: Duration,
    #[cfg(feature = "rustls-tls")]
    inner: tokio_rustls::TlsConnector,
    #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
    inner: tokio_native_tls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Builds a connector: trust roots, optional extra CA file, optional
    /// client certificate, and the skip-verify escape hatch.
    pub fn new(
        config: &TlsConfig,
        server_name: impl Into<String>,
        handshake_timeout: Duration,
    ) -> SmtpResult<Self> {
        let server_name = server_name.into();

        #[cfg(feature = "rustls-tls")]
        {
            let client_config = rustls_support::client_config(config)?;
            Ok(Self {
                server_name,
                handshake_timeout,
                inner: tokio_rustls::TlsConnector::from(std::sync::Arc::new(client_config)),
            })
        }

        #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
        {
            let connector = native_support::connector(config)?;
            Ok(Self {
                server_name,
                handshake_timeout,
                inner: tokio_native_tls::TlsConnector::from(connector),
            })
        }

        #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
        {
            let _ = (config, server_name, handshake_timeout);
            Err(SmtpError::configuration("No TLS implementation available"))
        }
    }

    /// Returns the name verified against the server certificate.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[allow(unused_variables)]
    async fn handshake(&self, tcp: TcpStream) -> SmtpResult<TransportStream> {
        #[cfg(feature = "rustls-tls")]
        {
            use rustls::pki_types::ServerName;

            let name = ServerName::try_from(self.server_name.clone()).map_err(|_| {
                SmtpError::connection(
                    ConnectStage::Tls,
                    format!("Invalid server name: {}", self.server_name),
                )
            })?;
            let stream = timeout(self.handshake_timeout, self.inner.connect(name, tcp))
                .await
                .map_err(|_| SmtpError::connection(ConnectStage::Tls, "TLS handshake timed out"))?
                .map_err(|e| {
                    SmtpError::connection(ConnectStage::Tls, format!("TLS handshake failed: {}", e))
                        .with_cause(e)
                })?;
            Ok(TransportStream::Rustls(Box::new(stream)))
        }

        #[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
        {
            let stream = timeout(self.handshake_timeout, self.inner.connect(&self.server_name, tcp))
                .await
                .map_err(|_| SmtpError::connection(ConnectStage::Tls, "TLS handshake timed out"))?
                .map_err(|e| {
                    SmtpError::connection(ConnectStage::Tls, format!("TLS handshake failed: {}", e))
                        .with_cause(e)
                })?;
            Ok(TransportStream::NativeTls(Box::new(stream)))
        }

        #[cfg(not(any(feature = "rustls-tls", feature = "native-tls")))]
        {
            Err(SmtpError::configuration("No TLS implementation available"))
        }
    }
}

#[cfg(any(feature = "rustls-tls", feature = "native-tls"))]
fn read_pem(path: &std::path::Path) -> SmtpResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        SmtpError::configuration(format!("Failed to read {}: {}", path.display(), e)).with_cause(e)
    })
}

#[cfg(feature = "rustls-tls")]
mod rustls_support {
    use super::read_pem;
    use crate::config::TlsConfig;
    use crate::errors::{SmtpError, SmtpResult};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    pub(super) fn client_config(config: &TlsConfig) -> SmtpResult<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder();
        let builder = if config.accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(path) = &config.ca_cert_path {
                for cert in rustls_pemfile::certs(&mut read_pem(path)?.as_slice()) {
                    let cert = cert.map_err(|e| {
                        SmtpError::configuration(format!("Invalid CA certificate: {}", e))
                    })?;
                    roots.add(cert).map_err(|e| {
                        SmtpError::configuration(format!("Invalid CA certificate: {}", e))
                    })?;
                }
            }
            builder.with_root_certificates(roots)
        };

        match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = rustls_pemfile::certs(&mut read_pem(cert_path)?.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        SmtpError::configuration(format!("Invalid client certificate: {}", e))
                    })?;
                let key = rustls_pemfile::private_key(&mut read_pem(key_path)?.as_slice())
                    .map_err(|e| SmtpError::configuration(format!("Invalid client key: {}", e)))?
                    .ok_or_else(|| SmtpError::configuration("No private key found in key file"))?;
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    SmtpError::configuration(format!("Client certificate rejected: {}", e))
                })
            }
            _ => Ok(builder.with_no_client_auth()),
        }
    }

    #[derive(Debug)]
    struct AcceptAnyCertificate;

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ]
        }
    }
}

#[cfg(all(feature = "native-tls", not(feature = "rustls-tls")))]
mod native_support {
    use super::read_pem;
    use crate::config::TlsConfig;
    use crate::errors::{SmtpError, SmtpResult};

    pub(super) fn connector(config: &TlsConfig) -> SmtpResult<native_tls::TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();

        if config.accept_invalid_certs {
            builder.danger_accept_invalid_certs(true);
        }

        if let Some(path) = &config.ca_cert_path {
            let cert = native_tls::Certificate::from_pem(&read_pem(path)?)
                .map_err(|e| SmtpError::configuration(format!("Invalid CA certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) = (&config.client_cert_path, &config.client_key_path) {
            let identity = native_tls::Identity::from_pkcs8(&read_pem(cert_path)?, &read_pem(key_path)?)
                .map_err(|e| SmtpError::configuration(format!("Invalid client identity: {}", e)))?;
            builder.identity(identity);
        }

        builder
            .build()
            .map_err(|e| SmtpError::configuration(format!("Failed to build TLS connector: {}", e)))
    }
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: BufReader<TransportStream>,
    command_timeout: Duration,
    peer: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl TcpTransport {
    /// Dials `address`, bounded by `connect_timeout`, and enables TCP
    /// keep-alive with the given idle interval.
    ///
    /// No bytes are exchanged; the caller reads the greeting (after a
    /// direct TLS handshake, if any).
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        keep_alive: Duration,
        command_timeout: Duration,
    ) -> SmtpResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                SmtpError::connection(
                    ConnectStage::Dial,
                    format!("Connect to {} timed out after {:?}", address, connect_timeout),
                )
            })?
            .map_err(|e| {
                SmtpError::connection(ConnectStage::Dial, format!("Connect to {} failed: {}", address, e))
                    .with_cause(e)
            })?;

        stream.set_nodelay(true).ok();
        if !keep_alive.is_zero() {
            let keepalive = socket2::TcpKeepalive::new().with_time(keep_alive);
            if let Err(_e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "Failed to enable TCP keep-alive");
            }
        }

        Ok(Self {
            stream: BufReader::new(TransportStream::Plain(stream)),
            command_timeout,
            peer: address.to_string(),
        })
    }

    /// Reads lines until a complete reply has arrived.
    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout("Timed out waiting for server reply"))??;

            if read == 0 {
                return Err(SmtpError::io("Server closed connection"));
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let last = SmtpResponse::line_is_last(&line)?;
            lines.push(line);

            if last {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    /// Writes and flushes, each step bounded by the command timeout.
    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout("Write timed out"))??;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::timeout("Flush timed out"))??;

        Ok(())
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        let line = format!("{}\r\n", command.to_smtp_string());

        #[cfg(feature = "tracing")]
        tracing::debug!(command = %command, peer = %self.peer, "Sending SMTP command");

        Self::write_all(&mut self.stream, line.as_bytes(), self.command_timeout).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        Self::write_all(&mut self.stream, data, self.command_timeout).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let response = Self::read_response_inner(&mut self.stream, self.command_timeout).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");

        Ok(response)
    }

    async fn upgrade_tls(&mut self, connector: &TlsConnector) -> SmtpResult<()> {
        if self.is_tls() {
            return Ok(());
        }

        // Bytes pipelined ahead of the handshake would be trusted as if
        // they had arrived encrypted.
        if !self.stream.buffer().is_empty() {
            return Err(SmtpError::connection(
                ConnectStage::Tls,
                "Server sent data before the TLS handshake",
            ));
        }

        let tcp = match std::mem::replace(self.stream.get_mut(), TransportStream::Closed) {
            TransportStream::Plain(tcp) => tcp,
            _ => return Err(SmtpError::connection(ConnectStage::Tls, "Transport is closed")),
        };

        let tls = connector.handshake(tcp).await?;
        self.stream = BufReader::new(tls);

        #[cfg(feature = "tracing")]
        tracing::debug!(peer = %self.peer, server_name = %connector.server_name(), "TLS established");

        Ok(())
    }

    fn is_tls(&self) -> bool {
        !matches!(
            self.stream.get_ref(),
            TransportStream::Plain(_) | TransportStream::Closed
        )
    }

    async fn close(&mut self) {
        let _ = timeout(self.command_timeout, self.stream.get_mut().shutdown()).await;
        *self.stream.get_mut() = TransportStream::Closed;
    }
}
