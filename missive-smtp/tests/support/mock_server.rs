//! Scripted SMTP server for exercising the client over real sockets.
//!
//! The server can:
//! - answer EHLO differently before and after STARTTLS
//! - upgrade to TLS with a throwaway self-signed certificate
//! - run the AUTH LOGIN challenge exchange
//! - go silent after a chosen command, to provoke client timeouts
//! - record every command line and the message document it was sent
#![allow(dead_code)]

use std::{
    fmt::Write as _,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    },
};

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn to_wire(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

/// Renders `lines` as one multi-line reply.
fn multiline(code: u16, lines: &[String]) -> String {
    let mut reply = String::new();
    for (index, line) in lines.iter().enumerate() {
        let separator = if index + 1 == lines.len() { ' ' } else { '-' };
        let _ = write!(reply, "{code}{separator}{line}\r\n");
    }
    reply
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Vec<String>,
    ehlo_secure: Vec<String>,
    starttls: bool,
    auth: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    silent_after: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "ok"),
            ehlo: vec!["mock.example.com".to_string(), "AUTH LOGIN".to_string()],
            ehlo_secure: vec!["ok".to_string()],
            starttls: false,
            auth: Reply::new(235, "authenticated"),
            mail_from: Reply::new(250, "ok"),
            rcpt_to: Reply::new(250, "ok"),
            data: Reply::new(354, "send"),
            data_end: Reply::new(250, "queued"),
            quit: Reply::new(221, "bye"),
            silent_after: None,
        }
    }
}

/// What the server saw.
#[derive(Debug, Default)]
struct Recording {
    commands: RwLock<Vec<String>>,
    message: RwLock<Option<String>>,
    secured: AtomicBool,
    client_closed: AtomicBool,
}

enum Flow {
    Upgrade,
    Finished,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    recording: Arc<Recording>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received, in order. The message document is not
    /// included; see [`MockSmtpServer::message`].
    pub async fn commands(&self) -> Vec<String> {
        self.recording.commands.read().await.clone()
    }

    pub async fn count(&self, verb: &str) -> usize {
        self.commands()
            .await
            .iter()
            .filter(|command| {
                command
                    .split(' ')
                    .next()
                    .is_some_and(|first| first.eq_ignore_ascii_case(verb))
            })
            .count()
    }

    /// The document received between DATA and the `.` line, dot-stuffing
    /// intact.
    pub async fn message(&self) -> Option<String> {
        self.recording.message.read().await.clone()
    }

    pub fn secured(&self) -> bool {
        self.recording.secured.load(Ordering::SeqCst)
    }

    /// Polls until the client has closed its end, or `within` elapses.
    pub async fn wait_for_client_close(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.recording.client_closed.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.recording.client_closed.load(Ordering::SeqCst)
    }

    async fn handle_client(
        stream: TcpStream,
        script: Arc<Script>,
        recording: Arc<Recording>,
        acceptor: TlsAcceptor,
    ) -> io::Result<()> {
        let mut plain = BufReader::new(stream);
        plain
            .write_all(script.greeting.to_wire().as_bytes())
            .await?;
        plain.flush().await?;

        if let Flow::Finished = converse(&mut plain, &script, &recording, false).await? {
            return Ok(());
        }

        if !plain.buffer().is_empty() {
            return Err(io::Error::other("client sent data before the TLS handshake"));
        }

        let secure = match acceptor.accept(plain.into_inner()).into_fallible().await {
            Ok(secure) => secure,
            Err((err, mut stream)) => {
                // A client rejecting the certificate aborts and hangs up.
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
                recording.client_closed.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };
        recording.secured.store(true, Ordering::SeqCst);

        let mut secure = BufReader::new(secure);
        converse(&mut secure, &script, &recording, true).await?;
        Ok(())
    }
}

async fn read_line<S>(stream: &mut BufReader<S>, recording: &Recording) -> io::Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        recording.client_closed.store(true, Ordering::SeqCst);
        return Ok(None);
    }
    Ok(Some(line))
}

async fn reply<S>(stream: &mut BufReader<S>, text: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await
}

#[allow(clippy::too_many_lines)]
async fn converse<S>(
    stream: &mut BufReader<S>,
    script: &Script,
    recording: &Recording,
    secure: bool,
) -> io::Result<Flow>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = read_line(stream, recording).await? {
        let command = line.trim_end().to_string();
        recording.commands.write().await.push(command.clone());

        let verb = command
            .split(' ')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        if script
            .silent_after
            .as_deref()
            .is_some_and(|silent| silent.eq_ignore_ascii_case(&verb))
        {
            while read_line(stream, recording).await?.is_some() {}
            return Ok(Flow::Finished);
        }

        match verb.as_str() {
            "EHLO" => {
                let lines = if secure {
                    &script.ehlo_secure
                } else {
                    &script.ehlo
                };
                reply(stream, &multiline(250, lines)).await?;
            }
            "STARTTLS" if script.starttls && !secure => {
                reply(stream, "220 go ahead\r\n").await?;
                return Ok(Flow::Upgrade);
            }
            "AUTH" => {
                reply(stream, "334 VXNlcm5hbWU6\r\n").await?;
                let Some(username) = read_line(stream, recording).await? else {
                    return Ok(Flow::Finished);
                };
                recording
                    .commands
                    .write()
                    .await
                    .push(username.trim_end().to_string());

                reply(stream, "334 UGFzc3dvcmQ6\r\n").await?;
                let Some(password) = read_line(stream, recording).await? else {
                    return Ok(Flow::Finished);
                };
                recording
                    .commands
                    .write()
                    .await
                    .push(password.trim_end().to_string());

                reply(stream, &script.auth.to_wire()).await?;
            }
            "MAIL" => reply(stream, &script.mail_from.to_wire()).await?,
            "RCPT" => reply(stream, &script.rcpt_to.to_wire()).await?,
            "DATA" => {
                reply(stream, &script.data.to_wire()).await?;
                if script.data.code != 354 {
                    continue;
                }

                let mut message = String::new();
                loop {
                    let Some(line) = read_line(stream, recording).await? else {
                        return Ok(Flow::Finished);
                    };
                    if line == ".\r\n" {
                        break;
                    }
                    message.push_str(&line);
                }
                *recording.message.write().await = Some(message);

                if script
                    .silent_after
                    .as_deref()
                    .is_some_and(|silent| silent == ".")
                {
                    while read_line(stream, recording).await?.is_some() {}
                    return Ok(Flow::Finished);
                }
                reply(stream, &script.data_end.to_wire()).await?;
            }
            "QUIT" => {
                reply(stream, &script.quit.to_wire()).await?;
                while read_line(stream, recording).await?.is_some() {}
                return Ok(Flow::Finished);
            }
            _ => reply(stream, "502 command not implemented\r\n").await?,
        }
    }

    Ok(Flow::Finished)
}

/// A TLS acceptor using a freshly generated self-signed certificate.
#[allow(clippy::expect_used, reason = "test fixture setup")]
fn tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed certificate");
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .expect("server TLS configuration");

    TlsAcceptor::from(Arc::new(config))
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, text);
        self
    }

    /// EHLO reply lines before any upgrade, without codes.
    #[must_use]
    pub fn with_ehlo_lines(mut self, lines: &[&str]) -> Self {
        self.script.ehlo = lines.iter().map(ToString::to_string).collect();
        self
    }

    /// EHLO reply lines once the session is secure.
    #[must_use]
    pub fn with_secure_ehlo_lines(mut self, lines: &[&str]) -> Self {
        self.script.ehlo_secure = lines.iter().map(ToString::to_string).collect();
        self
    }

    /// Answer STARTTLS with `220` and perform the server handshake.
    #[must_use]
    pub const fn with_starttls(mut self) -> Self {
        self.script.starttls = true;
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.auth = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_quit_response(mut self, code: u16, text: impl Into<String>) -> Self {
        self.script.quit = Reply::new(code, text);
        self
    }

    /// Stop answering once `verb` arrives. `"."` means the end-of-data line.
    #[must_use]
    pub fn silent_after(mut self, verb: impl Into<String>) -> Self {
        self.script.silent_after = Some(verb.into());
        self
    }

    /// Binds to an ephemeral port on 127.0.0.1 and starts accepting.
    pub async fn build(self) -> io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let recording = Arc::new(Recording::default());
        let acceptor = tls_acceptor();

        let task_recording = Arc::clone(&recording);
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let script = Arc::clone(&script);
                let recording = Arc::clone(&task_recording);
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    if let Err(err) =
                        MockSmtpServer::handle_client(stream, script, recording, acceptor).await
                    {
                        eprintln!("mock server client error: {err}");
                    }
                });
            }
        });

        Ok(MockSmtpServer { addr, recording })
    }
}
