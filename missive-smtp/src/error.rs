//! Error types for the SMTP client.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{delivery::Stage, reply::Reply};

/// Everything that can end a delivery attempt.
///
/// None of these are retried internally; the caller owns the retry policy and
/// can use [`SmtpError::is_transient`] to drive it.
#[derive(Debug, Error)]
pub enum SmtpError {
    /// DNS, TCP, or (for implicit TLS) handshake failure while connecting.
    #[error("Failed to connect to {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: io::Error,
    },

    /// No complete reply arrived within the window. The session is torn down.
    #[error("No complete reply within {0:?}")]
    Timeout(Duration),

    /// The peer closed the connection while a reply was awaited.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// The server answered with a code outside the accepted set.
    #[error("Unexpected reply to {stage}: {reply}")]
    Protocol { stage: Stage, reply: Reply },

    /// The server sent something that is not an SMTP reply.
    #[error("Malformed SMTP reply: {0}")]
    MalformedReply(String),

    /// A command was issued while another was still awaiting its reply.
    #[error("A command is already awaiting its reply on this session")]
    ReentrantCall,

    /// STARTTLS could not be completed.
    #[error("TLS upgrade failed: {0}")]
    TlsUpgrade(String),

    /// The message is larger than the limit the server advertised with SIZE.
    #[error("Message of {size} bytes exceeds the server's limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// The request was rejected before any connection was made.
    #[error("Invalid delivery request: {0}")]
    InvalidRequest(String),

    /// Any other I/O failure on an established session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SmtpError {
    /// Maps a mid-session I/O failure, folding resets and EOFs into
    /// [`SmtpError::ConnectionClosed`].
    pub(crate) fn from_session_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }

    /// The server reply behind this failure, if there was one.
    #[must_use]
    pub const fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Protocol { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Returns `true` if a later attempt could plausibly succeed: network
    /// trouble, timeouts and 4xx replies.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout(_) | Self::ConnectionClosed | Self::Io(_) => {
                true
            }
            Self::Protocol { reply, .. } => reply.is_transient_failure(),
            Self::MalformedReply(_)
            | Self::ReentrantCall
            | Self::TlsUpgrade(_)
            | Self::MessageTooLarge { .. }
            | Self::InvalidRequest(_) => false,
        }
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, SmtpError>;
