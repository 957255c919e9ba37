//! Credential handling for SMTP AUTH.
//!
//! Sessions authenticate with PLAIN (RFC 4616). The password never leaves
//! a [`SecretString`] except while the initial response is encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::net::IpAddr;

use crate::config::SmtpConfig;
use crate::errors::{ConnectStage, SmtpError, SmtpResult};

/// SMTP AUTH mechanism name used by this client.
pub const PLAIN: &str = "PLAIN";

/// Username and password for PLAIN authentication.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates plain credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Takes the credentials from a configuration.
    pub fn from_config(config: &SmtpConfig) -> SmtpResult<Self> {
        let password = config
            .password
            .clone()
            .ok_or_else(|| SmtpError::validation("Password is required"))?;
        Ok(Self::new(config.username.clone(), password))
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Authentication helpers.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // \0username\0password
        let response = format!(
            "\0{}\0{}",
            credentials.username,
            credentials.password.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Refuses to send PLAIN credentials over an unencrypted connection,
    /// except to a loopback host.
    pub fn check_plain_allowed(tls: bool, host: &str) -> SmtpResult<()> {
        if tls || Self::is_loopback(host) {
            return Ok(());
        }
        Err(SmtpError::connection(
            ConnectStage::Auth,
            format!("Refusing to send credentials to {} over an unencrypted connection", host),
        ))
    }

    fn is_loopback(host: &str) -> bool {
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }
}
