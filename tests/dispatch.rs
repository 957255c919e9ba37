//! End-to-end dispatch against a loopback SMTP server.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use smtp_dispatch::errors::TransactionStage;
use smtp_dispatch::mocks::{test_config, test_email, MockSmtpServer};
use smtp_dispatch::{
    Email, Mailer, RateLimitConfig, SmtpConfig, SmtpErrorKind, StreamAttachment,
};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mailer(server: &MockSmtpServer) -> Mailer {
    Mailer::new(test_config(server.address()))
}

#[tokio::test]
async fn test_send_reaches_server() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    let result = mailer.send(test_email()).await.unwrap();
    assert_eq!(result.accepted, vec!["b@x.com"]);

    assert_eq!(server.count("MAIL FROM:<a@x.com>"), 1);
    assert_eq!(server.count("RCPT TO:<b@x.com>"), 1);
    assert_eq!(server.count("AUTH PLAIN"), 2);

    let messages = server.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Subject: S\r\n"));
    assert!(messages[0].contains("\r\n\r\nC\r\n"));
    assert!(messages[0].contains(&format!("Message-ID: <{}>", result.message_id)));

    mailer.close().await;
}

#[tokio::test]
async fn test_leading_dots_survive_transmission() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    let mut email = test_email();
    email.content = "first\n.leading\n.\n..\nlast".to_string();
    mailer.send(email).await.unwrap();

    let message = server.messages().remove(0);
    assert!(message.contains("\r\n\r\nfirst\r\n.leading\r\n.\r\n..\r\nlast\r\n"));
    assert!(message.ends_with("--\r\n"));
}

#[tokio::test]
async fn test_sessions_are_reused() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    for _ in 0..5 {
        mailer.send(test_email()).await.unwrap();
    }

    assert_eq!(server.connections(), 2);
    assert_eq!(server.messages().len(), 5);

    let status = mailer.pool_status().await.unwrap();
    assert_eq!(status.idle, 2);
    assert_eq!(status.outstanding, 0);
    assert_eq!(status.discarded, 0);
}

#[tokio::test]
async fn test_concurrent_sends_bound_idle_inventory() {
    let server = MockSmtpServer::start().await;
    let mailer = Arc::new(mailer(&server));

    let sends = (0..12).map(|_| {
        let mailer = mailer.clone();
        async move { mailer.send(test_email()).await }
    });
    let results = futures::future::join_all(sends).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let status = mailer.pool_status().await.unwrap();
    assert!(status.idle <= status.capacity);
    assert_eq!(status.outstanding, 0);
    assert_eq!(status.created - status.discarded, status.idle as u64);
    assert_eq!(server.messages().len(), 12);
}

#[tokio::test]
async fn test_invalid_recipient_opens_no_connection() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    let mut email = test_email();
    email.to.push("invalid.recipient".to_string());
    let err = mailer.send(email).await.unwrap_err();

    assert_eq!(err.kind(), SmtpErrorKind::Validation);
    assert_eq!(server.connections(), 0);
    assert!(mailer.pool_status().await.is_none());
}

#[tokio::test]
async fn test_rejected_recipient_discards_session() {
    let server = MockSmtpServer::builder()
        .reject_recipient("nobody@x.com")
        .start()
        .await;
    let mailer = mailer(&server);

    let mut email = test_email();
    email.to = vec!["nobody@x.com".to_string()];
    let err = mailer.send(email).await.unwrap_err();

    assert_eq!(
        err.kind(),
        SmtpErrorKind::Protocol(TransactionStage::RcptTo)
    );
    assert_eq!(err.smtp_code(), Some(550));
    assert!(err.message().contains("nobody@x.com"));

    let status = mailer.pool_status().await.unwrap();
    assert_eq!(status.idle, 1);
    assert_eq!(status.discarded, 1);

    // The remaining session still works.
    mailer.send(test_email()).await.unwrap();
}

#[tokio::test]
async fn test_rejected_auth_fails_pool_creation() {
    let server = MockSmtpServer::builder().reject_auth().start().await;
    let mailer = mailer(&server);

    let err = mailer.send(test_email()).await.unwrap_err();
    assert_eq!(
        err.kind(),
        SmtpErrorKind::Connection(smtp_dispatch::ConnectStage::Auth)
    );
    assert_eq!(err.smtp_code(), Some(535));
    assert!(mailer.pool_status().await.is_none());
}

#[tokio::test]
async fn test_stream_attachment_round_trip() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
    let mut email = test_email();
    email.stream_attachments.push(
        StreamAttachment::new("payload.bin", "application/octet-stream", Cursor::new(payload.clone()))
            .with_size(payload.len() as u64),
    );
    mailer.send(email).await.unwrap();

    let message = server.messages().remove(0);
    let marker = "filename=\"payload.bin\"\r\n\r\n";
    let start = message.find(marker).unwrap() + marker.len();
    let end = start + message[start..].find("\r\n--").unwrap();
    let encoded: String = message[start..end].split("\r\n").collect();

    assert_eq!(BASE64.decode(encoded).unwrap(), payload);
    assert!(server.commands().iter().any(|c| c.starts_with("MAIL FROM:<a@x.com> SIZE=")));
}

#[tokio::test]
async fn test_rate_limit_spaces_sends() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);
    mailer.set_rate_limit(&RateLimitConfig::per_second(2.0));
    assert_eq!(mailer.rate_limit(), Some(Duration::from_millis(500)));

    let started = Instant::now();
    for _ in 0..3 {
        mailer.send(test_email()).await.unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert!(mailer.metrics().rate_limit_waits >= 2);

    mailer.disable_rate_limit();
    assert_eq!(mailer.rate_limit(), None);

    let started = Instant::now();
    for _ in 0..3 {
        mailer.send(test_email()).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_unanswered_end_of_data_times_out() {
    let server = MockSmtpServer::builder().stall_end_of_data().start().await;
    let config = SmtpConfig {
        command_timeout: Duration::from_millis(200),
        pool_size: 1,
        ..test_config(server.address())
    };
    let mailer = Mailer::new(config);

    let err = mailer.send(test_email()).await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::Timeout);

    let status = mailer.pool_status().await.unwrap();
    assert_eq!(status.outstanding, 0);
    assert_eq!(status.idle, 0);
    assert_eq!(status.discarded, 1);
}

#[tokio::test]
async fn test_cancelled_send_releases_accounting() {
    let server = MockSmtpServer::builder().stall_end_of_data().start().await;
    let config = SmtpConfig {
        command_timeout: Duration::from_secs(30),
        pool_size: 1,
        ..test_config(server.address())
    };
    let mailer = Arc::new(Mailer::new(config));

    let handle = mailer.send_async(test_email());
    while server.messages().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.cancel();

    let err = handle.result().await.unwrap_err();
    assert_eq!(err.kind(), SmtpErrorKind::Cancelled);

    let status = mailer.pool_status().await.unwrap();
    assert_eq!(status.outstanding, 0);
    assert_eq!(status.idle, 0);
    assert_eq!(status.discarded, 1);
}

#[tokio::test]
async fn test_close_then_send_reopens_pool() {
    let server = MockSmtpServer::start().await;
    let mailer = mailer(&server);

    mailer.send(test_email()).await.unwrap();
    mailer.close().await;
    assert!(mailer.pool_status().await.is_none());
    assert_eq!(server.count("QUIT"), 2);

    mailer.send(test_email()).await.unwrap();
    assert_eq!(server.connections(), 4);
}

#[tokio::test]
async fn test_template_send() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("welcome.html"), "<p>Hello {{ name }}</p>").unwrap();

    let server = MockSmtpServer::start().await;
    let config = SmtpConfig {
        templates: smtp_dispatch::TemplateConfig {
            base_dir: dir.path().to_path_buf(),
            default_ext: "html".to_string(),
        },
        ..test_config(server.address())
    };
    let mailer = Mailer::new(config);

    let email: Email = test_email();
    mailer
        .send_template(email, "welcome", serde_json::json!({ "name": "Ada" }))
        .await
        .unwrap();

    let message = server.messages().remove(0);
    assert!(message.contains("Content-Type: text/html; charset=UTF-8"));
    assert!(message.contains("Hello Ada"));
}
