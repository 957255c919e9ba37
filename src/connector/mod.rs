//! Session establishment.
//!
//! A [`ConnectionFactory`] turns configuration into a ready [`Session`]:
//! dialled, greeted, encrypted as configured and authenticated.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::auth::Credentials;
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{ConnectStage, SmtpResult};
use crate::session::Session;
use crate::transport::{SmtpTransport, TcpTransport, TlsConnector};

/// Produces authenticated sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Opens a new session ready for a mail transaction.
    async fn connect(&self) -> SmtpResult<Session>;
}

/// Connection factory dialling a real SMTP server.
pub struct SmtpConnector {
    config: Arc<SmtpConfig>,
    credentials: Credentials,
    tls: Option<TlsConnector>,
}

impl fmt::Debug for SmtpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnector")
            .field("address", &self.config.address())
            .field("tls", &self.config.tls.mode)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl SmtpConnector {
    /// Creates a connector. TLS settings are loaded once here.
    pub fn new(config: Arc<SmtpConfig>) -> SmtpResult<Self> {
        config.validate()?;
        let credentials = Credentials::from_config(&config)?;
        let tls = if config.tls.is_enabled() {
            Some(TlsConnector::new(
                &config.tls,
                config.tls_server_name(),
                config.connect_timeout,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            credentials,
            tls,
        })
    }

    async fn establish(&self, session: &mut Session) -> SmtpResult<()> {
        session.read_greeting().await?;

        let client_id = self.config.client_id();
        session.hello(client_id).await?;

        if self.config.tls.mode == TlsMode::StartTls {
            if let Some(tls) = &self.tls {
                session.start_tls(tls, client_id).await?;
            }
        }

        session
            .authenticate(&self.credentials, &self.config.host)
            .await
    }
}

#[async_trait]
impl ConnectionFactory for SmtpConnector {
    async fn connect(&self) -> SmtpResult<Session> {
        let mut transport = TcpTransport::connect(
            &self.config.address(),
            self.config.connect_timeout,
            self.config.keep_alive,
            self.config.command_timeout,
        )
        .await?;

        if self.config.tls.mode == TlsMode::Implicit {
            if let Some(tls) = &self.tls {
                if let Err(e) = transport.upgrade_tls(tls).await {
                    transport.close().await;
                    return Err(e.at_connect_stage(ConnectStage::Tls));
                }
            }
        }

        let mut session = Session::new(Box::new(transport));
        match self.establish(&mut session).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    session = session.id(),
                    address = %self.config.address(),
                    tls = session.is_tls(),
                    "Session established"
                );
                Ok(session)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(address = %self.config.address(), error = %e, "Session setup failed");
                session.quit().await;
                Err(e)
            }
        }
    }
}
