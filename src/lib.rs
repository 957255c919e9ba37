//! # SMTP Dispatch
//!
//! An email-dispatch client built around a pool of authenticated SMTP
//! sessions:
//! - Session pool with overflow-create / overflow-discard semantics
//! - Direct TLS, STARTTLS and AUTH PLAIN session setup
//! - Multipart MIME assembly with attachments streamed from readers
//! - Optional fixed-rate throttling shared by every send
//! - Lazily compiled body templates
//! - Cancellable background sends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smtp_dispatch::{Email, Mailer, SmtpConfig, TlsMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .tls_mode(TlsMode::StartTls)
//!         .build()?;
//!
//!     let mailer = Mailer::new(config);
//!
//!     let email = Email::builder()
//!         .from("Sender", "sender@example.com")
//!         .to("recipient@example.com")
//!         .subject("Hello from Rust!")
//!         .content("<p>This is a test email.</p>")
//!         .build();
//!
//!     let result = mailer.send(email).await?;
//!     println!("Message sent with ID: {}", result.message_id);
//!
//!     mailer.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// Sessions and pooling
pub mod connector;
pub mod pool;
pub mod session;

// Message assembly
pub mod mime;
pub mod template;

// Throttling
pub mod ratelimit;

// Observability
pub mod observability;

// Client
pub mod client;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use client::{Mailer, SendHandle};
pub use config::{
    RateLimitConfig, SmtpConfig, SmtpConfigBuilder, TemplateConfig, TlsConfig, TlsMode,
};
pub use connector::{ConnectionFactory, SmtpConnector};
pub use errors::{ConnectStage, SmtpError, SmtpErrorKind, SmtpResult, TransactionStage};
pub use mime::{BodySink, MessageBuilder, PreparedMessage};
pub use observability::{DispatchMetrics, MetricsSnapshot};
pub use pool::SessionPool;
pub use ratelimit::RateLimiter;
pub use session::{Session, SessionHealth};
pub use template::TemplateCache;
pub use types::{
    Attachment, ContentType, Email, EmailBuilder, Envelope, PoolStatus, SendResult,
    StreamAttachment,
};
pub use auth::Credentials;
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::SmtpTransport;
