//! SMTP reply framing and representation.
//!
//! [`frame`] is a pure function over whatever bytes have been accumulated so
//! far. It knows nothing about which command the reply answers.

use std::{fmt, str::FromStr};

use crate::error::{Result, SmtpError};

/// A complete server reply: the 3-digit code and the raw text of every line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    /// Raw reply lines, without their line terminators.
    lines: Vec<String>,
}

/// How one reply line relates to the rest of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    /// `250-...`
    Continuation,
    /// `250 ...`, `250\t...` or a bare `250`
    Last,
}

impl Reply {
    /// The status code, e.g. `250`.
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// The raw reply text, lines joined with CRLF, without the final CRLF.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\r\n")
    }

    /// The text after the code and separator on each line.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(|line| line.get(4..).unwrap_or_default())
    }

    /// `2xx`
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `3xx`, e.g. `334` and `354`.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// `4xx`
    #[must_use]
    pub const fn is_transient_failure(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// `5xx`
    #[must_use]
    pub const fn is_permanent_failure(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

impl FromStr for Reply {
    type Err = SmtpError;

    /// Parses text that must hold exactly one complete reply.
    fn from_str(s: &str) -> Result<Self> {
        match frame(s.as_bytes())? {
            Some((reply, consumed)) if consumed == s.len() => Ok(reply),
            Some(_) => Err(SmtpError::MalformedReply(format!(
                "trailing data after reply: {s:?}"
            ))),
            None => Err(SmtpError::MalformedReply(format!("incomplete reply: {s:?}"))),
        }
    }
}

/// Classifies a single line (terminator already stripped).
fn classify(line: &[u8]) -> Result<(u16, LineKind)> {
    let malformed = || SmtpError::MalformedReply(String::from_utf8_lossy(line).into_owned());

    let digits = line.get(..3).ok_or_else(malformed)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    let code = digits
        .iter()
        .fold(0_u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));

    let kind = match line.get(3) {
        None | Some(b' ' | b'\t') => LineKind::Last,
        Some(b'-') => LineKind::Continuation,
        Some(_) => return Err(malformed()),
    };

    Ok((code, kind))
}

/// Looks for one complete reply at the start of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, or the reply together with
/// the number of bytes it occupied. Anything after those bytes (a queued
/// second reply, say) is left for the next call.
///
/// # Errors
///
/// Returns [`SmtpError::MalformedReply`] if a complete line is not a reply
/// line, or if the code changes part way through a multi-line reply.
pub fn frame(buffer: &[u8]) -> Result<Option<(Reply, usize)>> {
    let mut start = 0;
    let mut code = None;
    let mut lines = Vec::new();

    while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
        let end = start + offset;
        let line = buffer[start..end]
            .strip_suffix(b"\r")
            .unwrap_or(&buffer[start..end]);
        start = end + 1;

        let (line_code, kind) = classify(line)?;
        match code {
            Some(expected) if expected != line_code => {
                return Err(SmtpError::MalformedReply(format!(
                    "status code changed from {expected} to {line_code} mid-reply"
                )));
            }
            _ => code = Some(line_code),
        }
        lines.push(String::from_utf8_lossy(line).into_owned());

        if kind == LineKind::Last {
            return Ok(Some((
                Reply {
                    code: line_code,
                    lines,
                },
                start,
            )));
        }
    }

    Ok(None)
}
