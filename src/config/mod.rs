//! Configuration types for the dispatch client.
//!
//! Provides configuration with builder pattern for:
//! - Server connection settings and timeouts
//! - TLS policy (none, STARTTLS, direct)
//! - Credentials
//! - Connection pool sizing
//! - Rate limiting
//! - Template lookup

use std::path::PathBuf;
use std::time::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for establishing the TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP keep-alive interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Default timeout for each command reply and each body write.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Pool capacity used when the requested size is zero.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default template file extension.
pub const DEFAULT_TEMPLATE_EXT: &str = ".html";

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS. Credentials and mail travel in clear text.
    ///
    /// This is the default when no TLS configuration is given. Plain
    /// authentication is refused on such sessions unless the server is on
    /// a loopback address.
    #[default]
    None,
    /// Plain dial, then upgrade in place with STARTTLS.
    StartTls,
    /// Wrap the socket in TLS before any protocol exchange (port 465).
    Implicit,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Server name used for SNI and certificate verification.
    ///
    /// Defaults to the configured host.
    pub server_name: Option<String>,
    /// Accept any server certificate (testing only).
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Path to a PEM file of additional trusted CA certificates.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to a PEM client certificate chain (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to the PEM private key matching the client certificate.
    pub client_key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Returns true if any form of TLS is requested.
    pub fn is_enabled(&self) -> bool {
        self.mode != TlsMode::None
    }

    /// Validates the TLS configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(SmtpError::configuration(
                "client_cert_path and client_key_path must be set together",
            ));
        }

        if self.accept_invalid_certs {
            #[cfg(feature = "tracing")]
            tracing::warn!("TLS certificate verification is disabled");
        }

        Ok(())
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the TLS mode.
    pub fn mode(mut self, mode: TlsMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the server name used for verification.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = Some(name.into());
        self
    }

    /// Sets whether to accept invalid certificates (testing only).
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// Sets the CA certificate path.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    /// Sets the client certificate and key paths for mTLS.
    pub fn client_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.config.client_cert_path = Some(cert.into());
        self.config.client_key_path = Some(key.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> SmtpResult<TlsConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default)]
    pub enabled: bool,
    /// Sends permitted per second.
    #[serde(default)]
    pub per_second: f64,
}

impl RateLimitConfig {
    /// Creates an enabled rate limit.
    pub fn per_second(rate: f64) -> Self {
        Self {
            enabled: true,
            per_second: rate,
        }
    }

    /// Returns the tick interval, or `None` when no throttling applies.
    ///
    /// A disabled limit, or a rate that is not a positive finite number,
    /// means no limiter.
    pub fn interval(&self) -> Option<Duration> {
        if !self.enabled || !self.per_second.is_finite() || self.per_second <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(1.0 / self.per_second).ok()
    }
}

/// Template lookup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Directory templates are loaded from.
    #[serde(default)]
    pub base_dir: PathBuf,
    /// Extension appended to template names without one.
    #[serde(default = "default_template_ext")]
    pub default_ext: String,
}

fn default_template_ext() -> String {
    DEFAULT_TEMPLATE_EXT.to_string()
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            default_ext: default_template_ext(),
        }
    }
}

/// Connection configuration shared by every send on a [`crate::Mailer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication username.
    pub username: String,
    /// Authentication password (never serialized).
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// TCP keep-alive interval.
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Deadline applied to each command reply and each body write.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Target number of idle pooled sessions. Zero selects the default.
    #[serde(default)]
    pub pool_size: usize,
    /// Rate limit configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Template lookup configuration.
    #[serde(default)]
    pub templates: TemplateConfig,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_keep_alive() -> Duration { DEFAULT_KEEP_ALIVE }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Parses a configuration from JSON.
    pub fn from_json(json: &str) -> SmtpResult<Self> {
        let config: SmtpConfig = serde_json::from_str(json)
            .map_err(|e| SmtpError::configuration(format!("Invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Missing connection fields are validation errors so that a send with
    /// an incomplete configuration fails before touching the network.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::validation("Host is required"));
        }

        if self.port == 0 {
            return Err(SmtpError::validation("Port is required"));
        }

        if self.username.is_empty() {
            return Err(SmtpError::validation("Username is required"));
        }

        match &self.password {
            Some(p) if !p.expose_secret().is_empty() => {}
            _ => return Err(SmtpError::validation("Password is required")),
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(SmtpError::configuration("Timeouts must be non-zero"));
        }

        self.tls.validate()
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the pool capacity, substituting the default for zero.
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool_size
        }
    }

    /// Returns the name presented to the server for verification and SNI.
    pub fn tls_server_name(&self) -> &str {
        self.tls.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    username: String,
    password: Option<SecretString>,
    tls: TlsConfig,
    connect_timeout: Duration,
    keep_alive: Duration,
    command_timeout: Duration,
    pool_size: usize,
    rate_limit: RateLimitConfig,
    templates: TemplateConfig,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the TCP keep-alive interval.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Sets the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the pool size. Zero selects the default capacity.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets rate limit configuration.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Sets the template directory and default extension.
    pub fn templates(mut self, base_dir: impl Into<PathBuf>, default_ext: impl Into<String>) -> Self {
        self.templates = TemplateConfig {
            base_dir: base_dir.into(),
            default_ext: default_ext.into(),
        };
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the configuration, filling unset timeouts with defaults.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let or_default = |d: Duration, default: Duration| if d.is_zero() { default } else { d };

        let config = SmtpConfig {
            host: self.host.ok_or_else(|| SmtpError::validation("Host is required"))?,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            username: self.username,
            password: self.password,
            tls: self.tls,
            connect_timeout: or_default(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT),
            keep_alive: or_default(self.keep_alive, DEFAULT_KEEP_ALIVE),
            command_timeout: or_default(self.command_timeout, DEFAULT_COMMAND_TIMEOUT),
            pool_size: self.pool_size,
            rate_limit: self.rate_limit,
            templates: self.templates,
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
