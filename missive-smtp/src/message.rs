//! Message document assembly: RFC 5322 headers, a dot-stuffed text body, and
//! optionally a `multipart/mixed` wrapper carrying base64 attachments.
//!
//! The rendered document is sent verbatim after `DATA`; it always ends with
//! CRLF so the `.` terminator line can follow directly.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::{Result, SmtpError};

/// Bytes outside RFC 2231 `attribute-char` that must be percent-encoded in an
/// extended parameter value.
const PARAMETER_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Width of a base64 body line, excluding CRLF.
const BASE64_LINE_WIDTH: usize = 76;

/// Raw UTF-8 bytes per RFC 2047 encoded-word, keeping each word under 75
/// characters once base64-encoded and wrapped.
const ENCODED_WORD_BYTES: usize = 45;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Attachment data, either raw or already base64-encoded by the caller.
#[derive(Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Vec<u8>),
    /// Whitespace is ignored; line breaks are re-wrapped when rendered.
    Base64(String),
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(bytes) => write!(f, "Raw({} bytes)", bytes.len()),
            Self::Base64(text) => write!(f, "Base64({} chars)", text.len()),
        }
    }
}

/// A file carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Sanitized before it is placed in any header.
    pub filename: String,
    /// `application/octet-stream` when absent.
    pub content_type: Option<String>,
    pub payload: Payload,
}

impl Attachment {
    /// An attachment from raw bytes.
    #[must_use]
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            payload: Payload::Raw(data),
        }
    }

    /// An attachment whose payload is already base64.
    #[must_use]
    pub fn from_base64(filename: impl Into<String>, encoded: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            payload: Payload::Base64(encoded.into()),
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Reads a file, naming the attachment after it and guessing its type
    /// from the extension.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError::InvalidRequest`] if the path has no usable file
    /// name or cannot be read.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                SmtpError::InvalidRequest(format!(
                    "attachment path {} has no file name",
                    path.display()
                ))
            })?
            .to_string();

        let data = tokio::fs::read(path).await.map_err(|err| {
            SmtpError::InvalidRequest(format!(
                "failed to read attachment {}: {err}",
                path.display()
            ))
        })?;

        Ok(Self::new(filename, data).with_content_type(guess_content_type(path)))
    }

    /// Whether a base64 payload decodes. Raw payloads always do.
    pub(crate) fn payload_is_valid(&self) -> bool {
        match &self.payload {
            Payload::Raw(_) => true,
            Payload::Base64(text) => {
                let compact: String = text
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                STANDARD.decode(compact).is_ok()
            }
        }
    }
}

/// Renders the message document.
///
/// With no attachments this is a single `text/plain` body. Otherwise the body
/// becomes the first part of a `multipart/mixed` document followed by one
/// base64 part per attachment.
#[must_use]
pub fn build(
    from: &str,
    to: &[String],
    reply_to: Option<&str>,
    subject: &str,
    body: &str,
    attachments: &[Attachment],
) -> Vec<u8> {
    let body = dot_stuff(body);

    let boundary = if attachments.is_empty() {
        None
    } else {
        let mut boundary = generate_boundary();
        while body.contains(&boundary) {
            boundary = generate_boundary();
        }
        Some(boundary)
    };

    render(
        from,
        to,
        reply_to,
        subject,
        &body,
        attachments,
        boundary.as_deref(),
    )
    .into_bytes()
}

fn render(
    from: &str,
    to: &[String],
    reply_to: Option<&str>,
    subject: &str,
    stuffed_body: &str,
    attachments: &[Attachment],
    boundary: Option<&str>,
) -> String {
    let mut out = String::with_capacity(stuffed_body.len() + 512);

    header(&mut out, "From", from);
    header(&mut out, "To", &to.join(", "));
    if let Some(reply_to) = reply_to {
        header(&mut out, "Reply-To", reply_to);
    }
    header(&mut out, "Subject", &encode_subject(subject));
    header(&mut out, "MIME-Version", "1.0");

    let Some(boundary) = boundary else {
        text_part_headers(&mut out);
        out.push_str("\r\n");
        out.push_str(stuffed_body);
        return out;
    };

    header(
        &mut out,
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{boundary}\""),
    );
    out.push_str("\r\n");

    delimiter(&mut out, boundary);
    text_part_headers(&mut out);
    out.push_str("\r\n");
    out.push_str(stuffed_body);

    for attachment in attachments {
        let filename = sanitize_filename(&attachment.filename);
        let content_type = attachment
            .content_type
            .as_deref()
            .map(sanitize_content_type)
            .filter(|content_type| !content_type.is_empty())
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

        delimiter(&mut out, boundary);
        header(
            &mut out,
            "Content-Type",
            &format!("{content_type}; {}", filename_parameter("name", &filename)),
        );
        header(
            &mut out,
            "Content-Disposition",
            &format!("attachment; {}", filename_parameter("filename", &filename)),
        );
        header(&mut out, "Content-Transfer-Encoding", "base64");
        out.push_str("\r\n");

        match &attachment.payload {
            Payload::Raw(data) => wrap_base64(&STANDARD.encode(data), &mut out),
            Payload::Base64(encoded) => wrap_base64(encoded, &mut out),
        }
    }

    out.push_str("--");
    out.push_str(boundary);
    out.push_str("--\r\n");
    out
}

fn header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn text_part_headers(out: &mut String) {
    header(out, "Content-Type", "text/plain; charset=\"UTF-8\"");
    header(out, "Content-Transfer-Encoding", "8bit");
}

fn delimiter(out: &mut String, boundary: &str) {
    out.push_str("--");
    out.push_str(boundary);
    out.push_str("\r\n");
}

/// Normalizes every line ending to CRLF and doubles a leading `.` on each
/// line. Non-empty output always ends with CRLF.
pub fn dot_stuff(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len() + normalized.len() / 32 + 2);

    for line in normalized.split_terminator('\n') {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out
}

/// Replaces the characters that could break out of a quoted header value.
fn sanitize_filename(filename: &str) -> String {
    filename.replace(['\r', '\n', '"'], "_")
}

/// `name="value"` for ASCII names, otherwise the RFC 2231 extended form
/// `name*=UTF-8''percent-encoded`.
fn filename_parameter(name: &str, filename: &str) -> String {
    if filename.is_ascii() {
        format!("{name}=\"{filename}\"")
    } else {
        format!(
            "{name}*=UTF-8''{}",
            utf8_percent_encode(filename, PARAMETER_VALUE)
        )
    }
}

fn sanitize_content_type(content_type: &str) -> String {
    content_type
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Folds CR/LF to spaces and wraps non-ASCII text in RFC 2047 encoded-words.
fn encode_subject(subject: &str) -> String {
    let flat = subject.replace(['\r', '\n'], " ");
    if flat.is_ascii() {
        return flat;
    }

    let mut words = Vec::new();
    let mut chunk = String::with_capacity(ENCODED_WORD_BYTES);
    for c in flat.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?UTF-8?B?{}?=", STANDARD.encode(&chunk)));
    }

    words.join("\r\n ")
}

/// Timestamp plus 64 random bits.
fn generate_boundary() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    format!("----=_Missive_{millis:x}_{:016x}", rand::random::<u64>())
}

/// Appends `encoded` (whitespace ignored) as CRLF-terminated lines of at most
/// 76 characters.
fn wrap_base64(encoded: &str, out: &mut String) {
    let mut column = 0;
    for c in encoded.chars().filter(|c| !c.is_ascii_whitespace()) {
        if column == BASE64_LINE_WIDTH {
            out.push_str("\r\n");
            column = 0;
        }
        out.push(c);
        column += 1;
    }
    if column > 0 {
        out.push_str("\r\n");
    }
}

/// Guesses the MIME content type based on file extension.
fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match extension.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "json" => "application/json",
        "xml" => "application/xml",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => FALLBACK_CONTENT_TYPE,
    }
}
