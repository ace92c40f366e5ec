//! One SMTP connection, driven strictly half-duplex.
//!
//! A [`Session`] owns exactly one socket at a time. The socket moves through
//! `Plain -> Secure` at most once (STARTTLS) and ends `Closed`, either through
//! [`Session::close`] or because an exchange failed. Every exchange writes one
//! command and waits for one reply inside a single timeout window; nothing is
//! read speculatively.

use std::{fmt, io, mem, time::Duration};

use missive_common::{incoming, internal, outgoing};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::client::TlsStream;

use crate::{
    error::{Result, SmtpError},
    reply::{self, Reply},
    tls,
};

/// Upper bound on bytes buffered while waiting for one reply to complete.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Settings fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Window for connecting, for each reply, and for the TLS handshake.
    pub timeout: Duration,
    /// **SECURITY WARNING**: skips certificate verification.
    pub accept_invalid_certs: bool,
}

impl SessionOptions {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            accept_invalid_certs: false,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

enum Transport<S> {
    Plain(S),
    Secure(Box<TlsStream<S>>),
    Closed,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Secure(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn read_buf(&mut self, buffer: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read_buf(buffer).await,
            Self::Secure(stream) => stream.read_buf(buffer).await,
            Self::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Secure(stream) => stream.shutdown().await,
            Self::Closed => Ok(()),
        }
    }
}

/// A single connection to an SMTP server.
pub struct Session<S = TcpStream> {
    transport: Transport<S>,
    /// Bytes read but not yet framed into a reply.
    buffer: Vec<u8>,
    /// Set while a command is waiting for its reply. Left set if that wait is
    /// abandoned, which poisons the session.
    awaiting: bool,
    options: SessionOptions,
}

impl Session<TcpStream> {
    /// Opens a TCP connection, wrapped in TLS from the first byte when
    /// `secure` is set. Resolution, connect and handshake share one window.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError::Connection`] if any of those steps fail or the
    /// window expires.
    #[tracing::instrument(skip(options), fields(timeout = ?options.timeout))]
    pub async fn connect(
        host: &str,
        port: u16,
        secure: bool,
        options: SessionOptions,
    ) -> Result<Self> {
        let address = format!("{host}:{port}");

        let attempt = async {
            let stream = TcpStream::connect((host, port)).await?;
            if !secure {
                return Ok(Transport::Plain(stream));
            }

            let name = tls::server_name(host)?;
            let stream = tls::connector(options.accept_invalid_certs)
                .connect(name, stream)
                .await?;
            Ok::<_, io::Error>(Transport::Secure(Box::new(stream)))
        };

        let transport = match tokio::time::timeout(options.timeout, attempt).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(source)) => return Err(SmtpError::Connection { address, source }),
            Err(_) => {
                return Err(SmtpError::Connection {
                    address,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("not connected within {:?}", options.timeout),
                    ),
                });
            }
        };

        internal!(level = DEBUG, secure, "Connected to {address}");

        Ok(Self {
            transport,
            buffer: Vec::new(),
            awaiting: false,
            options,
        })
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-connected plaintext stream.
    pub const fn from_stream(stream: S, options: SessionOptions) -> Self {
        Self {
            transport: Transport::Plain(stream),
            buffer: Vec::new(),
            awaiting: false,
            options,
        }
    }

    /// Waits for the unsolicited reply a server sends on connect.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send`].
    pub async fn greeting(&mut self) -> Result<Reply> {
        self.exchange(None, "").await
    }

    /// Writes `line` followed by CRLF and waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`SmtpError::ReentrantCall`] if an earlier command never got its reply
    /// - [`SmtpError::Timeout`] if no complete reply arrives in time
    /// - [`SmtpError::ConnectionClosed`] if the peer goes away mid-wait
    /// - [`SmtpError::MalformedReply`] if the server sends something else
    ///
    /// Any failure leaves the session closed.
    pub async fn send(&mut self, line: &str) -> Result<Reply> {
        self.send_line(line, line).await
    }

    /// As [`Session::send`], but the line is logged as `<redacted>`.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send`].
    pub async fn send_redacted(&mut self, line: &str) -> Result<Reply> {
        self.send_line(line, "<redacted>").await
    }

    /// Writes a rendered message document and the `.` terminator line, then
    /// waits for the reply. The document must already be dot-stuffed.
    ///
    /// # Errors
    ///
    /// Same as [`Session::send`].
    pub async fn send_document(&mut self, document: &[u8]) -> Result<Reply> {
        let mut payload = Vec::with_capacity(document.len() + 5);
        payload.extend_from_slice(document);
        if !payload.is_empty() && !payload.ends_with(b"\r\n") {
            payload.extend_from_slice(b"\r\n");
        }
        payload.extend_from_slice(b".\r\n");

        let shown = format!("<{} byte message>", document.len());
        self.exchange(Some(&payload), &shown).await
    }

    /// Re-wraps the plaintext socket in a TLS client handshake addressed to
    /// `server_name`. The caller must already have had `220` to STARTTLS.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError::TlsUpgrade`] if bytes arrived after the STARTTLS
    /// reply, if the session is already secure, or if the handshake fails or
    /// exceeds the timeout window. The session is closed in each case.
    pub async fn upgrade(&mut self, server_name: &str) -> Result<()> {
        if self.awaiting {
            return Err(SmtpError::ReentrantCall);
        }

        if !self.buffer.is_empty() {
            let residue = self.buffer.len();
            self.teardown();
            return Err(SmtpError::TlsUpgrade(format!(
                "server sent {residue} unexpected bytes before the TLS handshake"
            )));
        }

        let name = match tls::server_name(server_name) {
            Ok(name) => name,
            Err(err) => {
                self.teardown();
                return Err(SmtpError::TlsUpgrade(err.to_string()));
            }
        };

        let stream = match mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Plain(stream) => stream,
            Transport::Secure(stream) => {
                self.transport = Transport::Secure(stream);
                return Err(SmtpError::TlsUpgrade(
                    "session is already secure".to_string(),
                ));
            }
            Transport::Closed => return Err(SmtpError::ConnectionClosed),
        };

        let window = self.options.timeout;
        let connector = tls::connector(self.options.accept_invalid_certs);

        match tokio::time::timeout(window, connector.connect(name, stream)).await {
            Ok(Ok(stream)) => {
                self.transport = Transport::Secure(Box::new(stream));
                internal!(level = DEBUG, "Upgraded session to TLS with {server_name}");
                Ok(())
            }
            Ok(Err(err)) => Err(SmtpError::TlsUpgrade(err.to_string())),
            Err(_) => Err(SmtpError::TlsUpgrade(format!(
                "handshake did not complete within {window:?}"
            ))),
        }
    }

    /// Shuts the socket down. Calling this more than once is harmless.
    pub async fn close(&mut self) {
        if matches!(self.transport, Transport::Closed) {
            return;
        }

        if let Ok(Err(err)) =
            tokio::time::timeout(self.options.timeout, self.transport.shutdown()).await
        {
            internal!(level = DEBUG, error = %err, "Error shutting session down");
        }

        self.teardown();
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self.transport, Transport::Secure(_))
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.transport, Transport::Closed)
    }

    async fn send_line(&mut self, line: &str, shown: &str) -> Result<Reply> {
        if line.contains(['\r', '\n']) {
            return Err(SmtpError::InvalidRequest(
                "command lines must not contain CR or LF".to_string(),
            ));
        }

        let mut payload = Vec::with_capacity(line.len() + 2);
        payload.extend_from_slice(line.as_bytes());
        payload.extend_from_slice(b"\r\n");

        self.exchange(Some(&payload), shown).await
    }

    /// Writes `payload` (if any) and reads one reply, all inside one window.
    async fn exchange(&mut self, payload: Option<&[u8]>, shown: &str) -> Result<Reply> {
        if self.awaiting {
            return Err(SmtpError::ReentrantCall);
        }
        if self.is_closed() {
            return Err(SmtpError::ConnectionClosed);
        }

        if payload.is_some() {
            outgoing!("{shown}");
        }

        self.awaiting = true;
        let window = self.options.timeout;
        let result = tokio::time::timeout(window, self.round_trip(payload))
            .await
            .unwrap_or_else(|_| Err(SmtpError::Timeout(window)));
        self.awaiting = false;

        if let Err(err) = &result {
            internal!(level = DEBUG, error = %err, "Tearing session down");
            self.teardown();
        }

        result
    }

    async fn round_trip(&mut self, payload: Option<&[u8]>) -> Result<Reply> {
        if let Some(payload) = payload {
            self.transport
                .write_all(payload)
                .await
                .map_err(SmtpError::from_session_io)?;
        }

        loop {
            if let Some((reply, consumed)) = reply::frame(&self.buffer)? {
                self.buffer.drain(..consumed);
                incoming!(code = reply.code(), "{reply}");
                return Ok(reply);
            }

            if self.buffer.len() >= MAX_BUFFER_SIZE {
                return Err(SmtpError::MalformedReply(format!(
                    "no complete reply within {MAX_BUFFER_SIZE} bytes"
                )));
            }

            let read = self
                .transport
                .read_buf(&mut self.buffer)
                .await
                .map_err(SmtpError::from_session_io)?;
            if read == 0 {
                return Err(SmtpError::ConnectionClosed);
            }
        }
    }

    /// Drops the socket without a goodbye.
    fn teardown(&mut self) {
        self.transport = Transport::Closed;
        self.buffer.clear();
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.transport {
            Transport::Plain(_) => "plain",
            Transport::Secure(_) => "secure",
            Transport::Closed => "closed",
        };

        f.debug_struct("Session")
            .field("state", &state)
            .field("buffered", &self.buffer.len())
            .field("awaiting", &self.awaiting)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;

    fn session(timeout: Duration) -> (Session<DuplexStream>, BufReader<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            Session::from_stream(client, SessionOptions::new(timeout)),
            BufReader::new(server),
        )
    }

    async fn read_command(server: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_send_frames_reply_written_in_pieces() {
        let (mut session, mut server) = session(Duration::from_secs(5));

        let peer = tokio::spawn(async move {
            assert_eq!(read_command(&mut server).await, "EHLO localhost\r\n");
            for chunk in ["25", "0-mail.example.com\r", "\n250-SIZE 100\r\n250 ", "HELP\r\n"] {
                server.get_mut().write_all(chunk.as_bytes()).await.unwrap();
                tokio::task::yield_now().await;
            }
            server
        });

        let reply = session.send("EHLO localhost").await.unwrap();
        assert_eq!(reply.code(), 250);
        assert_eq!(
            reply.text(),
            "250-mail.example.com\r\n250-SIZE 100\r\n250 HELP"
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_replies_are_consumed_one_per_exchange() {
        let (mut session, mut server) = session(Duration::from_secs(5));
        server
            .get_mut()
            .write_all(b"220 ready\r\n250 ok\r\n")
            .await
            .unwrap();

        assert_eq!(session.greeting().await.unwrap().code(), 220);
        assert_eq!(session.send("NOOP").await.unwrap().code(), 250);
        assert_eq!(read_command(&mut server).await, "NOOP\r\n");
    }

    #[tokio::test]
    async fn test_timeout_tears_session_down() {
        let (mut session, mut server) = session(Duration::from_millis(50));

        let err = session.send("DATA").await.unwrap_err();
        assert!(matches!(err, SmtpError::Timeout(window) if window == Duration::from_millis(50)));
        assert!(session.is_closed());

        // The client half is gone: the peer sees the command, then EOF.
        assert_eq!(read_command(&mut server).await, "DATA\r\n");
        assert_eq!(read_command(&mut server).await, "");

        assert!(matches!(
            session.send("NOOP").await,
            Err(SmtpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_abandoned_send_poisons_session() {
        let (mut session, _server) = session(Duration::from_secs(5));

        let abandoned = tokio::time::timeout(Duration::from_millis(20), session.send("NOOP")).await;
        assert!(abandoned.is_err());

        assert!(matches!(
            session.send("NOOP").await,
            Err(SmtpError::ReentrantCall)
        ));
        assert!(matches!(
            session.upgrade("localhost").await,
            Err(SmtpError::ReentrantCall)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_mid_wait() {
        let (mut session, server) = session(Duration::from_secs(5));
        drop(server);

        let err = session.greeting().await.unwrap_err();
        assert!(matches!(err, SmtpError::ConnectionClosed));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_garbage_reply_is_malformed() {
        let (mut session, mut server) = session(Duration::from_secs(5));
        server
            .get_mut()
            .write_all(b"HTTP/1.1 400 Bad Request\r\n")
            .await
            .unwrap();

        assert!(matches!(
            session.greeting().await,
            Err(SmtpError::MalformedReply(_))
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_endless_reply_is_capped() {
        let (mut session, mut server) = session(Duration::from_secs(10));

        tokio::spawn(async move {
            let line = format!("250-{}\r\n", "x".repeat(1000));
            for _ in 0..1100 {
                if server.get_mut().write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        assert!(matches!(
            session.greeting().await,
            Err(SmtpError::MalformedReply(_))
        ));
    }

    #[tokio::test]
    async fn test_upgrade_refuses_residual_bytes() {
        let (mut session, mut server) = session(Duration::from_secs(5));
        server
            .get_mut()
            .write_all(b"220 go ahead\r\n250 smuggled\r\n")
            .await
            .unwrap();

        assert_eq!(session.send("STARTTLS").await.unwrap().code(), 220);

        let err = session.upgrade("localhost").await.unwrap_err();
        assert!(matches!(err, SmtpError::TlsUpgrade(_)));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_line_breaks_in_commands_are_rejected() {
        let (mut session, _server) = session(Duration::from_secs(5));

        assert!(matches!(
            session.send("MAIL FROM:<a@b>\r\nRSET").await,
            Err(SmtpError::InvalidRequest(_))
        ));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_send_document_appends_terminator() {
        let (mut session, mut server) = session(Duration::from_secs(5));

        let peer = tokio::spawn(async move {
            let mut received = Vec::new();
            loop {
                let line = read_command(&mut server).await;
                let done = line == ".\r\n";
                received.push(line);
                if done {
                    break;
                }
            }
            server.get_mut().write_all(b"250 queued\r\n").await.unwrap();
            received
        });

        let reply = session.send_document(b"Subject: hi\r\n\r\nbody").await.unwrap();
        assert_eq!(reply.code(), 250);
        assert_eq!(
            peer.await.unwrap(),
            vec!["Subject: hi\r\n", "\r\n", "body\r\n", ".\r\n"]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _server) = session(Duration::from_secs(5));
        assert!(!session.is_secure());

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.send("QUIT").await,
            Err(SmtpError::ConnectionClosed)
        ));
    }
}
