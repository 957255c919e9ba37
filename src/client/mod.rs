//! Dispatch entry points.
//!
//! [`Mailer`] validates a message, waits on the rate limiter, borrows a
//! pooled session, drives the SMTP transaction and streams the MIME body.
//! [`Mailer::send_async`] runs the same path on a task behind a
//! cancellable [`SendHandle`].

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;

use crate::config::{RateLimitConfig, SmtpConfig};
use crate::connector::{ConnectionFactory, SmtpConnector};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::{MessageBuilder, PreparedMessage};
use crate::observability::{DispatchMetrics, MetricsSnapshot, Timer};
use crate::pool::SessionPool;
use crate::protocol::SmtpResponse;
use crate::ratelimit::RateLimiter;
use crate::session::Session;
use crate::template::TemplateCache;
use crate::types::{ContentType, Email, PoolStatus, SendResult};

/// Sends email through a lazily created session pool.
///
/// A mailer is cheap to share behind an [`Arc`]; every method takes `&self`.
pub struct Mailer {
    config: Arc<SmtpConfig>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    pool: AsyncRwLock<Option<Arc<SessionPool>>>,
    limiter: RwLock<Option<Arc<RateLimiter>>>,
    templates: TemplateCache,
    builder: MessageBuilder,
    metrics: Arc<DispatchMetrics>,
}

impl fmt::Debug for Mailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailer")
            .field("address", &self.config.address())
            .field("rate_limit", &self.rate_limit())
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}

impl Mailer {
    /// Creates a mailer. Nothing is validated or dialled until the first send.
    pub fn new(config: SmtpConfig) -> Self {
        let config = Arc::new(config);
        let limiter = RateLimiter::from_config(&config.rate_limit).map(Arc::new);
        Self {
            templates: TemplateCache::new(&config.templates),
            builder: MessageBuilder::new(config.host.clone()),
            factory: None,
            pool: AsyncRwLock::new(None),
            limiter: RwLock::new(limiter),
            metrics: Arc::new(DispatchMetrics::new()),
            config,
        }
    }

    /// Creates a mailer whose sessions come from `factory` instead of
    /// dialling the configured server.
    pub fn with_factory(config: SmtpConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let mut mailer = Self::new(config);
        mailer.factory = Some(factory);
        mailer
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Returns the template cache, e.g. to register template functions.
    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    /// Sends one email and waits for the server's verdict.
    pub async fn send(&self, mut email: Email) -> SmtpResult<SendResult> {
        let timer = Timer::start("send");
        self.metrics.record_attempt();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            from = %email.from,
            recipients = email.to.len() + email.cc.len() + email.bcc.len(),
            "Sending email"
        );

        match self.dispatch(&mut email).await {
            Ok((response, message_id, accepted, session_id, bytes)) => {
                self.metrics.record_success(bytes);
                let duration = timer.stop();

                #[cfg(feature = "tracing")]
                tracing::debug!(message_id = %message_id, session = session_id, ?duration, "Email sent");

                Ok(SendResult {
                    message_id,
                    accepted,
                    response: response.to_string(),
                    session_id,
                    duration,
                })
            }
            Err(e) => {
                self.metrics.record_failure();

                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Send failed");

                Err(e)
            }
        }
    }

    /// Starts a send on a background task.
    ///
    /// The returned handle yields the result, and cancels the send if it is
    /// dropped before completion.
    pub fn send_async(self: &Arc<Self>, email: Email) -> SendHandle {
        let mailer = Arc::clone(self);
        SendHandle {
            task: Some(tokio::spawn(async move { mailer.send(email).await })),
        }
    }

    /// Renders template `name` with `context` as the HTML body, then sends.
    pub async fn send_template<S>(&self, mut email: Email, name: &str, context: S) -> SmtpResult<SendResult>
    where
        S: Serialize + Send,
    {
        email.content = self.templates.render(name, context).await?;
        email.content_type = ContentType::TextHtml;
        self.send(email).await
    }

    /// Renders a human-readable view of `email` without sending it.
    pub fn preview(&self, email: &Email) -> String {
        self.builder.preview(email)
    }

    /// Replaces the rate limiter. A disabled or non-positive rate removes it.
    pub fn set_rate_limit(&self, config: &RateLimitConfig) {
        let limiter = RateLimiter::from_config(config).map(Arc::new);

        #[cfg(feature = "tracing")]
        tracing::debug!(period = ?limiter.as_ref().map(|l| l.period()), "Rate limit reconfigured");

        *self.limiter.write() = limiter;
    }

    /// Removes throttling for subsequent sends.
    pub fn disable_rate_limit(&self) {
        *self.limiter.write() = None;
    }

    /// Returns the interval between sends, if throttled.
    pub fn rate_limit(&self) -> Option<std::time::Duration> {
        self.limiter.read().as_ref().map(|l| l.period())
    }

    /// Returns the pool status, or `None` before the first send.
    pub async fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.read().await.as_ref().map(|p| p.status())
    }

    /// Returns dispatch counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Closes the pool. The next send opens a new one.
    pub async fn close(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    async fn dispatch(
        &self,
        email: &mut Email,
    ) -> SmtpResult<(SmtpResponse, String, Vec<String>, u64, u64)> {
        self.config.validate()?;
        email.validate()?;

        let limiter = self.limiter.read().clone();
        if let Some(limiter) = limiter {
            let waited = limiter.wait().await;
            self.metrics.record_rate_limit_wait(waited);
        }

        let prepared = self.builder.prepare(email)?;
        let pool = self.pool().await?;
        let mut session = pool.acquire().await?;

        let lease = Lease::new(&pool);
        let result = self.transact(&mut session, email, &prepared).await;
        lease.disarm();

        let session_id = session.id();
        if result.is_err() {
            session.mark_broken();
        }
        pool.release(session).await;

        let (response, accepted, bytes) = result?;
        Ok((response, prepared.message_id().to_string(), accepted, session_id, bytes))
    }

    async fn transact(
        &self,
        session: &mut Session,
        email: &mut Email,
        prepared: &PreparedMessage,
    ) -> SmtpResult<(SmtpResponse, Vec<String>, u64)> {
        let envelope = email.envelope();

        session
            .mail_from(&envelope.from, Some(prepared.estimated_size()))
            .await?;
        for recipient in &envelope.recipients {
            session.rcpt_to(recipient).await?;
        }

        let mut data = session.data().await?;
        let bytes = self
            .builder
            .write_to(prepared, &mut email.stream_attachments, &mut data)
            .await?;
        let response = data.finish().await?;

        Ok((response, envelope.recipients, bytes))
    }

    async fn pool(&self) -> SmtpResult<Arc<SessionPool>> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        // Creation runs under the write lock so concurrent first sends
        // share one pool.
        let mut slot = self.pool.write().await;
        if let Some(pool) = slot.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let factory: Arc<dyn ConnectionFactory> = match &self.factory {
            Some(factory) => factory.clone(),
            None => Arc::new(SmtpConnector::new(self.config.clone())?),
        };
        let pool = Arc::new(SessionPool::create(factory, self.config.effective_pool_size()).await?);
        *slot = Some(pool.clone());
        Ok(pool)
    }
}

/// Keeps pool accounting straight when a send is dropped while holding a
/// session.
struct Lease<'a> {
    pool: &'a SessionPool,
    armed: bool,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a SessionPool) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon();
        }
    }
}

/// Handle to a send running on a background task.
///
/// Dropping the handle cancels the send unless [`detach`](Self::detach)
/// was called.
#[derive(Debug)]
pub struct SendHandle {
    task: Option<JoinHandle<SmtpResult<SendResult>>>,
}

impl SendHandle {
    /// Waits for the send to finish.
    ///
    /// Returns a `Cancelled` error if the send was cancelled first.
    pub async fn result(mut self) -> SmtpResult<SendResult> {
        let Some(task) = self.task.as_mut() else {
            return Err(SmtpError::cancelled());
        };
        let joined = task.await;
        self.task = None;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SmtpError::cancelled()),
            Err(e) => Err(SmtpError::new(
                SmtpErrorKind::Io,
                format!("Send task failed: {}", e),
            )),
        }
    }

    /// Requests cancellation. A send that already finished keeps its result.
    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Returns true once the send has finished or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Lets the send run to completion with nobody collecting the result.
    pub fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for SendHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConnectStage, TransactionStage};
    use crate::mocks::{test_config, test_email, MockConnectionFactory, MockReply};
    use crate::types::StreamAttachment;
    use rstest::rstest;
    use std::io::Cursor;
    use std::time::Duration;

    fn mailer_with(factory: Arc<MockConnectionFactory>) -> Mailer {
        Mailer::with_factory(test_config("127.0.0.1:2525"), factory)
    }

    #[tokio::test]
    async fn test_send_drives_transaction() {
        let factory = Arc::new(MockConnectionFactory::new());
        let journal = factory.journal();
        let mailer = mailer_with(factory.clone());

        let mut email = test_email();
        email.cc.push("c@x.com".to_string());
        email.bcc.push("d@x.com".to_string());
        let result = mailer.send(email).await.unwrap();

        assert_eq!(result.accepted, vec!["b@x.com", "c@x.com", "d@x.com"]);
        assert!(result.response.starts_with("250"));

        let rcpts: Vec<String> = journal
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("RCPT"))
            .collect();
        assert_eq!(rcpts, vec!["RCPT TO:<b@x.com>", "RCPT TO:<c@x.com>", "RCPT TO:<d@x.com>"]);

        let data = String::from_utf8(journal.data()).unwrap();
        assert!(data.contains("Subject: S\r\n"));
        assert!(data.ends_with("\r\n.\r\n"));

        let status = mailer.pool_status().await.unwrap();
        assert_eq!(status.capacity, 2);
        assert_eq!(status.idle, 2);
        assert_eq!(mailer.metrics().sends_succeeded, 1);
    }

    #[rstest]
    #[case::to(|e: &mut Email| e.to.push("invalid.recipient".to_string()))]
    #[case::cc(|e: &mut Email| e.cc.push("invalid.recipient".to_string()))]
    #[case::bcc(|e: &mut Email| e.bcc.push("invalid.recipient".to_string()))]
    #[case::no_subject(|e: &mut Email| e.subject.clear())]
    #[case::no_name(|e: &mut Email| e.from_name.clear())]
    #[case::blank_name(|e: &mut Email| e.from_name = "   ".to_string())]
    #[tokio::test]
    async fn test_validation_touches_no_network(#[case] corrupt: fn(&mut Email)) {
        let factory = Arc::new(MockConnectionFactory::new());
        let mailer = mailer_with(factory.clone());

        let mut email = test_email();
        corrupt(&mut email);
        let err = mailer.send(email).await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::Validation);
        assert_eq!(factory.connect_count(), 0);
        assert!(mailer.pool_status().await.is_none());
    }

    #[tokio::test]
    async fn test_incomplete_config_is_validation_error() {
        let mut config = test_config("127.0.0.1:2525");
        config.username.clear();
        let factory = Arc::new(MockConnectionFactory::new());
        let mailer = Mailer::with_factory(config, factory.clone());

        let err = mailer.send(test_email()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Validation);
        assert_eq!(factory.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_recipient_discards_session() {
        let factory = Arc::new(
            MockConnectionFactory::new().with_reply("RCPT", MockReply::new(550, "5.1.1 unknown user")),
        );
        let mailer = mailer_with(factory.clone());

        let err = mailer.send(test_email()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Protocol(TransactionStage::RcptTo));
        assert_eq!(err.smtp_code(), Some(550));

        let status = mailer.pool_status().await.unwrap();
        assert_eq!(status.idle, 1);
        assert_eq!(status.discarded, 1);
        assert_eq!(mailer.metrics().sends_failed, 1);
    }

    #[tokio::test]
    async fn test_pool_creation_failure_surfaces() {
        let factory = Arc::new(MockConnectionFactory::new().fail_after(0));
        let mailer = mailer_with(factory);

        let err = mailer.send(test_email()).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::Connection(ConnectStage::Dial));
        assert!(mailer.pool_status().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_share_pool() {
        let factory = Arc::new(MockConnectionFactory::new().with_connect_delay(Duration::from_millis(20)));
        let mailer = Arc::new(mailer_with(factory.clone()));

        let handles: Vec<_> = (0..8).map(|_| mailer.send_async(test_email())).collect();
        for handle in handles {
            handle.result().await.unwrap();
        }

        let status = mailer.pool_status().await.unwrap();
        assert_eq!(status.outstanding, 0);
        assert!(status.idle <= 2);
        assert_eq!(status.created as usize, factory.connect_count());
    }

    #[tokio::test]
    async fn test_close_then_send_reopens() {
        let factory = Arc::new(MockConnectionFactory::new());
        let mailer = mailer_with(factory.clone());

        mailer.send(test_email()).await.unwrap();
        mailer.close().await;
        assert!(mailer.pool_status().await.is_none());
        assert_eq!(factory.journal().closed(), 2);

        mailer.send(test_email()).await.unwrap();
        assert_eq!(factory.connect_count(), 4);
    }

    #[tokio::test]
    async fn test_stream_attachment_sent() {
        let factory = Arc::new(MockConnectionFactory::new());
        let journal = factory.journal();
        let mailer = mailer_with(factory);

        let mut email = test_email();
        email.stream_attachments.push(StreamAttachment::new(
            "notes.txt",
            "text/plain",
            Cursor::new(b"streamed bytes".to_vec()),
        ));
        mailer.send(email).await.unwrap();

        let data = String::from_utf8(journal.data()).unwrap();
        assert!(data.contains("filename=\"notes.txt\""));
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let factory = Arc::new(MockConnectionFactory::new().with_connect_delay(Duration::from_millis(200)));
        let mailer = Arc::new(mailer_with(factory));

        let handle = mailer.send_async(test_email());
        handle.cancel();
        assert!(matches!(
            handle.result().await.map_err(|e| e.kind()),
            Err(SmtpErrorKind::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_reconfiguration() {
        let mailer = mailer_with(Arc::new(MockConnectionFactory::new()));
        assert!(mailer.rate_limit().is_none());

        mailer.set_rate_limit(&RateLimitConfig::per_second(5.0));
        assert_eq!(mailer.rate_limit(), Some(Duration::from_millis(200)));

        mailer.set_rate_limit(&RateLimitConfig::per_second(0.0));
        assert!(mailer.rate_limit().is_none());

        mailer.set_rate_limit(&RateLimitConfig::per_second(2.0));
        mailer.disable_rate_limit();
        assert!(mailer.rate_limit().is_none());
    }

    #[tokio::test]
    async fn test_send_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.html"), "<p>Hi {{ name }}</p>").unwrap();
        let mut config = test_config("127.0.0.1:2525");
        config.templates.base_dir = dir.path().to_path_buf();

        let factory = Arc::new(MockConnectionFactory::new());
        let journal = factory.journal();
        let mailer = Mailer::with_factory(config, factory);

        mailer
            .send_template(test_email(), "hello", minijinja::context! { name => "Ana" })
            .await
            .unwrap();

        let data = String::from_utf8(journal.data()).unwrap();
        assert!(data.contains("text/html; charset=UTF-8"));
        assert!(data.contains("Hi Ana"));
    }

    #[test]
    fn test_preview_needs_no_runtime() {
        let mailer = Mailer::new(test_config("127.0.0.1:2525"));
        let preview = mailer.preview(&test_email());
        assert!(preview.contains("Subject: S"));
    }
}
