//! Benchmarks for message assembly and pooled dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use smtp_dispatch::mocks::{test_config, test_email, MockConnectionFactory};
use smtp_dispatch::{Attachment, Email, Mailer, MessageBuilder, StreamAttachment};
use std::io::Cursor;
use std::sync::Arc;

fn email_with_attachment(size: usize) -> Email {
    let mut email = test_email();
    email.content = "<p>Quarterly report attached.</p>\n".repeat(40);
    email
        .attachments
        .push(Attachment::from_bytes("report.pdf", vec![0x42; size]));
    email
}

fn benchmark_prepare(c: &mut Criterion) {
    let builder = MessageBuilder::new("bench.local");
    let mut group = c.benchmark_group("prepare");

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let email = email_with_attachment(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &email, |b, email| {
            b.iter(|| black_box(builder.prepare(email).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_stream_encoding(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let builder = MessageBuilder::new("bench.local");
    let payload = vec![0x5au8; 4 * 1024 * 1024];

    c.bench_function("stream_attachment_4mb", |b| {
        b.to_async(&rt).iter(|| async {
            let mut email = test_email();
            email.stream_attachments.push(StreamAttachment::new(
                "blob.bin",
                "application/octet-stream",
                Cursor::new(payload.clone()),
            ));
            black_box(builder.build(&mut email).await.unwrap())
        });
    });
}

fn benchmark_pooled_send(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mailer = Arc::new(Mailer::with_factory(
        test_config("127.0.0.1:2525"),
        Arc::new(MockConnectionFactory::new()),
    ));

    c.bench_function("pooled_send_mock", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(mailer.send(test_email()).await.unwrap()) });
    });
}

criterion_group!(
    benches,
    benchmark_prepare,
    benchmark_stream_encoding,
    benchmark_pooled_send
);
criterion_main!(benches);
