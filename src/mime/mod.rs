//! MIME assembly for outgoing messages.
//!
//! Messages are always `multipart/mixed`: one body part in the email's
//! content type, then one base64 part per in-memory attachment, then one
//! per streaming attachment. Everything except the streaming parts is
//! rendered up front by [`MessageBuilder::prepare`]; the streaming parts are
//! encoded from their readers straight into a [`BodySink`] by
//! [`MessageBuilder::write_to`], so memory use does not grow with their size.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use std::fmt::Write as _;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpResult};
use crate::types::{Attachment, ContentDisposition, Email, StreamAttachment};

/// Raw bytes per base64 line (76 encoded columns).
const BASE64_LINE_INPUT: usize = 57;

/// Base64 lines encoded per read from a streaming attachment.
const STREAM_LINES_PER_READ: usize = 64;

const MAX_HEADER_LINE: usize = 78;

/// Hard limit on a header line, excluding CRLF.
const MAX_LINE_OCTETS: usize = 998;

/// Raw bytes per RFC 2047 encoded word: 60 base64 columns plus the
/// `=?UTF-8?B?`/`?=` wrapper keeps each word under 75 characters.
const ENCODED_WORD_INPUT: usize = 45;

/// Destination for message bytes.
#[async_trait]
pub trait BodySink: Send {
    /// Appends a chunk of the message.
    async fn write_chunk(&mut self, chunk: &[u8]) -> SmtpResult<()>;
}

#[async_trait]
impl BodySink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: &[u8]) -> SmtpResult<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// A message whose headers, body part and in-memory attachments are rendered.
#[derive(Debug, Clone)]
pub struct PreparedMessage {
    message_id: String,
    boundary: String,
    head: Vec<u8>,
    stream_headers_len: usize,
    stream_size_hint: u64,
}

impl PreparedMessage {
    /// Returns the Message-ID, without angle brackets.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Returns the multipart boundary.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Returns the rendered portion of the message.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Estimates the encoded size of the complete message, for the SIZE
    /// parameter. Streaming attachments without a size hint count as empty
    /// apart from their part headers.
    pub fn estimated_size(&self) -> usize {
        let encoded_stream = self.stream_size_hint.div_ceil(BASE64_LINE_INPUT as u64) * 78;
        self.head.len()
            + self.stream_headers_len
            + encoded_stream as usize
            + self.boundary.len()
            + 8
    }
}

/// Assembles MIME documents.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    domain: String,
}

impl MessageBuilder {
    /// Creates a builder generating Message-IDs in `domain`.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// Renders everything except the streaming attachments.
    pub fn prepare(&self, email: &Email) -> SmtpResult<PreparedMessage> {
        let message_id = self.generate_message_id();
        let boundary = generate_boundary();
        let mut head = Vec::with_capacity(1024 + email.content.len());

        write_header(&mut head, "Date", &Utc::now().format("%a, %d %b %Y %H:%M:%S %z").to_string())?;
        write_header(&mut head, "Message-ID", &format!("<{}>", message_id))?;
        write_header(&mut head, "From", &format_mailbox(&email.from_name, &email.from))?;
        write_header(&mut head, "To", &email.to.join(", "))?;
        if !email.cc.is_empty() {
            write_header(&mut head, "Cc", &email.cc.join(", "))?;
        }
        if !email.bcc.is_empty() {
            write_header(&mut head, "Bcc", &email.bcc.join(", "))?;
        }
        write_header(&mut head, "Subject", &encode_header(&email.subject))?;
        write_header(&mut head, "MIME-Version", "1.0")?;
        write_header(
            &mut head,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        )?;
        head.extend_from_slice(b"\r\n");

        head.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        write_header(
            &mut head,
            "Content-Type",
            &format!("{}; charset=UTF-8", email.content_type),
        )?;
        write_header(&mut head, "Content-Transfer-Encoding", "quoted-printable")?;
        head.extend_from_slice(b"\r\n");
        head.extend_from_slice(&quoted_printable::encode(normalize_line_endings(&email.content)));
        head.extend_from_slice(b"\r\n");

        for attachment in &email.attachments {
            head.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            write_attachment_headers(
                &mut head,
                &attachment.filename,
                &attachment.content_type,
                attachment.disposition,
            )?;
            write_base64_lines(&mut head, &attachment.data);
        }

        // Streamed parts are written later; render their headers now so bad
        // metadata fails before any of the message goes out.
        let mut scratch = Vec::new();
        let mut stream_headers_len = 0;
        for attachment in &email.stream_attachments {
            scratch.clear();
            write_part_start(&mut scratch, &boundary, attachment)?;
            stream_headers_len += scratch.len();
        }

        Ok(PreparedMessage {
            message_id,
            boundary,
            head,
            stream_headers_len,
            stream_size_hint: email.stream_attachments.iter().filter_map(|a| a.size).sum(),
        })
    }

    /// Writes a prepared message to `sink`, encoding each streaming
    /// attachment from its reader, and closes the multipart body.
    ///
    /// Returns the number of bytes written.
    pub async fn write_to(
        &self,
        prepared: &PreparedMessage,
        stream_attachments: &mut [StreamAttachment],
        sink: &mut dyn BodySink,
    ) -> SmtpResult<u64> {
        sink.write_chunk(&prepared.head).await?;
        let mut written = prepared.head.len() as u64;

        let mut raw = vec![0u8; BASE64_LINE_INPUT * STREAM_LINES_PER_READ];
        let mut encoded = Vec::with_capacity(raw.len() / 3 * 4 + 2 * STREAM_LINES_PER_READ + 4);

        for attachment in stream_attachments.iter_mut() {
            let mut part = Vec::new();
            write_part_start(&mut part, &prepared.boundary, attachment)?;
            sink.write_chunk(&part).await?;
            written += part.len() as u64;

            loop {
                let filled = fill_buffer(attachment, &mut raw).await?;
                if filled == 0 {
                    break;
                }
                encoded.clear();
                write_base64_lines(&mut encoded, &raw[..filled]);
                sink.write_chunk(&encoded).await?;
                written += encoded.len() as u64;
                if filled < raw.len() {
                    break;
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(attachment = %attachment.filename, "Streamed attachment");
        }

        let closing = format!("--{}--\r\n", prepared.boundary);
        sink.write_chunk(closing.as_bytes()).await?;
        written += closing.len() as u64;

        Ok(written)
    }

    /// Renders a complete message into memory, consuming the email's
    /// streaming attachments.
    pub async fn build(&self, email: &mut Email) -> SmtpResult<(PreparedMessage, Vec<u8>)> {
        let prepared = self.prepare(email)?;
        let mut output = Vec::with_capacity(prepared.estimated_size());
        self.write_to(&prepared, &mut email.stream_attachments, &mut output)
            .await?;
        Ok((prepared, output))
    }

    /// Returns a human-readable rendering of the message without encoding
    /// it or touching streaming attachment readers.
    pub fn preview(&self, email: &Email) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "From: {}", format_mailbox_plain(&email.from_name, &email.from));
        let _ = writeln!(out, "To: {}", email.to.join(", "));
        if !email.cc.is_empty() {
            let _ = writeln!(out, "Cc: {}", email.cc.join(", "));
        }
        if !email.bcc.is_empty() {
            let _ = writeln!(out, "Bcc: {}", email.bcc.join(", "));
        }
        let _ = writeln!(out, "Subject: {}", email.subject);
        let _ = writeln!(out, "Content-Type: {}", email.content_type);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", email.content);

        if email.has_attachments() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Attachments:");
            for attachment in &email.attachments {
                let _ = writeln!(out, "  {}", describe_attachment(attachment));
            }
            for attachment in &email.stream_attachments {
                let size = attachment
                    .size
                    .map(|s| format!("{} bytes", s))
                    .unwrap_or_else(|| "unknown size".to_string());
                let _ = writeln!(
                    out,
                    "  {} ({}, streamed, {})",
                    attachment.filename, attachment.content_type, size
                );
            }
        }

        out
    }

    /// Generates a unique Message-ID in the builder's domain.
    pub fn generate_message_id(&self) -> String {
        format!("{}.{}@{}", Uuid::new_v4().simple(), Utc::now().timestamp(), self.domain)
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new("localhost")
    }
}

fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

fn describe_attachment(attachment: &Attachment) -> String {
    format!(
        "{} ({}, {} bytes, {})",
        attachment.filename,
        attachment.content_type,
        attachment.data.len(),
        attachment.disposition
    )
}

async fn fill_buffer(attachment: &mut StreamAttachment, buf: &mut [u8]) -> SmtpResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = attachment.reader.read(&mut buf[filled..]).await.map_err(|e| {
            SmtpError::build(format!(
                "Failed to read attachment {}: {}",
                attachment.filename, e
            ))
            .with_cause(e)
        })?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn write_part_start(
    out: &mut Vec<u8>,
    boundary: &str,
    attachment: &StreamAttachment,
) -> SmtpResult<()> {
    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    write_attachment_headers(
        out,
        &attachment.filename,
        &attachment.content_type,
        ContentDisposition::Attachment,
    )
}

fn write_attachment_headers(
    out: &mut Vec<u8>,
    filename: &str,
    content_type: &str,
    disposition: ContentDisposition,
) -> SmtpResult<()> {
    let parsed = parse_content_type(filename, content_type)?;
    let name = quote_parameter(filename);
    write_header(out, "Content-Type", &format!("{}; name={}", parsed.essence_str(), name))?;
    write_header(out, "Content-Transfer-Encoding", "base64")?;
    write_header(out, "Content-Disposition", &format!("{}; filename={}", disposition, name))?;
    if disposition == ContentDisposition::Inline {
        write_header(out, "Content-ID", &format!("<{}>", filename))?;
    }
    out.extend_from_slice(b"\r\n");
    Ok(())
}

fn parse_content_type(filename: &str, content_type: &str) -> SmtpResult<mime::Mime> {
    content_type.parse().map_err(|e| {
        SmtpError::build(format!(
            "Invalid content type {:?} for attachment {}: {}",
            content_type, filename, e
        ))
    })
}

fn write_base64_lines(out: &mut Vec<u8>, data: &[u8]) {
    for chunk in data.chunks(BASE64_LINE_INPUT) {
        let start = out.len();
        out.resize(start + chunk.len().div_ceil(3) * 4, 0);
        // The slice is sized for the padded output, so encoding cannot fail.
        let written = BASE64.encode_slice(chunk, &mut out[start..]).unwrap_or(0);
        out.truncate(start + written);
        out.extend_from_slice(b"\r\n");
    }
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(SmtpError::build(format!(
            "Header {} contains a line break",
            name
        )));
    }
    let line = format!("{}: {}", name, value);
    out.extend_from_slice(fold_header(&line).as_bytes());
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// Folds a header line at whitespace so no line exceeds 78 characters where
/// possible. A token longer than the 998-octet hard limit is split.
fn fold_header(header: &str) -> String {
    if header.len() <= MAX_HEADER_LINE {
        return header.to_string();
    }

    let mut result = String::with_capacity(header.len() + 16);
    let mut current = String::new();

    for word in header.split(' ').flat_map(|w| split_utf8(w, MAX_LINE_OCTETS - 1)) {
        if current.is_empty() {
            current.push_str(word);
        } else if current.len() + 1 + word.len() <= MAX_HEADER_LINE - 2 {
            current.push(' ');
            current.push_str(word);
        } else {
            result.push_str(&current);
            result.push_str("\r\n ");
            current = word.to_string();
        }
    }

    result.push_str(&current);
    result
}

/// Encodes a header value with RFC 2047 if it is not plain ASCII, or if it
/// has a word too long to fold onto a line of its own.
///
/// The value is split on character boundaries into space-separated encoded
/// words; decoders drop the whitespace between adjacent encoded words.
fn encode_header(value: &str) -> String {
    let printable = value.chars().all(|c| c.is_ascii() && !c.is_control());
    if printable && value.split(' ').all(|w| w.len() <= MAX_HEADER_LINE - 2) {
        return value.to_string();
    }
    split_utf8(value, ENCODED_WORD_INPUT)
        .map(|chunk| format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits `value` into pieces of at most `max` bytes without cutting a
/// character. An empty value yields one empty piece.
fn split_utf8(value: &str, max: usize) -> impl Iterator<Item = &str> {
    let mut rest = Some(value);
    std::iter::from_fn(move || {
        let current = rest?;
        let mut end = current.len().min(max);
        while !current.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than `max` still goes out whole.
        if end == 0 {
            end = current.chars().next().map_or(0, char::len_utf8);
        }
        let (piece, tail) = current.split_at(end);
        rest = (!tail.is_empty()).then_some(tail);
        Some(piece)
    })
}

fn format_mailbox(name: &str, address: &str) -> String {
    if name.is_empty() {
        return address.to_string();
    }
    let display = if !name.is_ascii() {
        encode_header(name)
    } else if name.contains(|c: char| "()<>[]:;@\\,.\"".contains(c)) {
        quote_string(name)
    } else {
        name.to_string()
    };
    format!("{} <{}>", display, address)
}

fn format_mailbox_plain(name: &str, address: &str) -> String {
    if name.is_empty() {
        address.to_string()
    } else {
        format!("{} <{}>", name, address)
    }
}

fn quote_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn quote_parameter(value: &str) -> String {
    if value.is_ascii() {
        quote_string(value)
    } else {
        format!("\"{}\"", encode_header(value))
    }
}

fn normalize_line_endings(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 16);
    let mut prev = 0u8;
    for &byte in text.as_bytes() {
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        prev = byte;
    }
    out
}
