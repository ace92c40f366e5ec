//! The delivery state machine.
//!
//! `connect -> 220 -> EHLO 250 -> [STARTTLS 220, EHLO 250] -> [AUTH LOGIN
//! 334, 334, 235] -> MAIL FROM 250 -> RCPT TO 250|251 (each) -> DATA 354 ->
//! document 250 -> QUIT`. Any other reply code aborts the attempt with
//! [`SmtpError::Protocol`]. The session is closed on every exit path and
//! nothing is retried.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{Result, SmtpError},
    extensions::Extensions,
    reply::Reply,
    request::{Credentials, DeliveryRequest},
    session::{Session, SessionOptions},
};

/// The command a reply was answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Greeting,
    Ehlo,
    StartTls,
    AuthLogin,
    MailFrom,
    RcptTo,
    Data,
    EndOfData,
    Quit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Greeting => "greeting",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::AuthLogin => "AUTH LOGIN",
            Self::MailFrom => "MAIL FROM",
            Self::RcptTo => "RCPT TO",
            Self::Data => "DATA",
            Self::EndOfData => "end of data",
            Self::Quit => "QUIT",
        })
    }
}

/// What a successful delivery looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// The server's reply to the end-of-data line, usually carrying a queue id.
    pub reply: Reply,
    /// Whether the message travelled over TLS.
    pub secure: bool,
    /// Whether AUTH LOGIN was performed.
    pub authenticated: bool,
}

/// Submits one message.
///
/// # Errors
///
/// Returns the first failure of the attempt; see [`SmtpError`]. The request
/// is validated before any connection is made.
#[tracing::instrument(
    level = "info",
    skip(request),
    fields(
        host = request.host(),
        port = request.port(),
        security = %request.security(),
        recipients = request.recipients().len(),
    )
)]
pub async fn deliver(request: &DeliveryRequest) -> Result<Receipt> {
    request.validate()?;
    let document = request.render();

    let options = SessionOptions {
        timeout: request.timeout(),
        accept_invalid_certs: request.accept_invalid_certs(),
    };
    let mut session = Session::connect(
        request.host(),
        request.port(),
        request.security().is_implicit(),
        options,
    )
    .await?;

    let outcome = transact(&mut session, request, &document).await;
    session.close().await;

    match &outcome {
        Ok(receipt) => tracing::info!(
            reply = %receipt.reply,
            secure = receipt.secure,
            authenticated = receipt.authenticated,
            "Message accepted"
        ),
        Err(err) => tracing::info!(error = %err, transient = err.is_transient(), "Delivery failed"),
    }

    outcome
}

/// Runs the conversation on an open session. Does not close it.
pub(crate) async fn transact<S>(
    session: &mut Session<S>,
    request: &DeliveryRequest,
    document: &[u8],
) -> Result<Receipt>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    expect(session.greeting().await?, Stage::Greeting, &[220])?;

    let ehlo = format!("EHLO {}", request.helo_name());
    let mut extensions = Extensions::from_ehlo(&expect(
        session.send(&ehlo).await?,
        Stage::Ehlo,
        &[250],
    )?);

    let security = request.security();
    if !session.is_secure() && security.allows_starttls() {
        if extensions.starttls() {
            expect(session.send("STARTTLS").await?, Stage::StartTls, &[220])?;
            session.upgrade(request.host()).await?;

            // Capabilities offered in plaintext no longer apply.
            extensions = Extensions::from_ehlo(&expect(
                session.send(&ehlo).await?,
                Stage::Ehlo,
                &[250],
            )?);
        } else if security.requires_starttls() {
            return Err(SmtpError::TlsUpgrade(
                "server does not advertise STARTTLS".to_string(),
            ));
        } else {
            tracing::debug!("STARTTLS not advertised, continuing in plaintext");
        }
    }

    check_size(&extensions, document.len())?;
    if !extensions.eight_bit_mime() && !document.is_ascii() {
        tracing::warn!("Server does not advertise 8BITMIME, sending an 8bit body anyway");
    }

    let authenticated = match request.credentials() {
        Some(credentials) => {
            authenticate(session, &extensions, credentials).await?;
            true
        }
        None => false,
    };

    expect(
        session
            .send(&mail_from(request.from_address(), &extensions, document.len()))
            .await?,
        Stage::MailFrom,
        &[250],
    )?;

    for recipient in request.recipients() {
        expect(
            session.send(&format!("RCPT TO:<{recipient}>")).await?,
            Stage::RcptTo,
            &[250, 251],
        )?;
    }

    expect(session.send("DATA").await?, Stage::Data, &[354])?;
    let reply = expect(
        session.send_document(document).await?,
        Stage::EndOfData,
        &[250],
    )?;
    let secure = session.is_secure();

    quit(session).await;

    Ok(Receipt {
        reply,
        secure,
        authenticated,
    })
}

async fn authenticate<S>(
    session: &mut Session<S>,
    extensions: &Extensions,
    credentials: &Credentials,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match extensions.auth_mechanisms() {
        Some(mechanisms) if !extensions.supports_auth("LOGIN") => tracing::warn!(
            advertised = ?mechanisms,
            "Server does not advertise AUTH LOGIN, attempting it anyway"
        ),
        _ => {}
    }

    expect(session.send("AUTH LOGIN").await?, Stage::AuthLogin, &[334])?;
    expect(
        session
            .send_redacted(&STANDARD.encode(&credentials.username))
            .await?,
        Stage::AuthLogin,
        &[334],
    )?;
    expect(
        session
            .send_redacted(&STANDARD.encode(&credentials.password))
            .await?,
        Stage::AuthLogin,
        &[235],
    )?;

    tracing::debug!(username = %credentials.username, "Authenticated");
    Ok(())
}

/// A non-zero advertised SIZE is a hard limit on the document.
const fn check_size(extensions: &Extensions, size: usize) -> Result<()> {
    match extensions.size() {
        Some(limit) if limit > 0 && size > limit => Err(SmtpError::MessageTooLarge { size, limit }),
        _ => Ok(()),
    }
}

/// `MAIL FROM`, declaring the size (RFC 1870) and 8bit body (RFC 6152) when
/// the server supports those parameters.
fn mail_from(address: &str, extensions: &Extensions, size: usize) -> String {
    let mut command = format!("MAIL FROM:<{address}>");
    if extensions.size().is_some() {
        command.push_str(&format!(" SIZE={size}"));
    }
    if extensions.eight_bit_mime() {
        command.push_str(" BODY=8BITMIME");
    }
    command
}

/// The message is already accepted at this point, so a failed QUIT is only
/// worth a warning.
async fn quit<S>(session: &mut Session<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match session.send("QUIT").await {
        Ok(reply) if reply.code() == 221 => {}
        Ok(reply) => tracing::warn!(%reply, "Unexpected reply to QUIT after the message was accepted"),
        Err(err) => tracing::warn!(error = %err, "QUIT failed after the message was accepted"),
    }
}

fn expect(reply: Reply, stage: Stage, accepted: &[u16]) -> Result<Reply> {
    if accepted.contains(&reply.code()) {
        tracing::debug!(%stage, code = reply.code(), "Stage complete");
        Ok(reply)
    } else {
        Err(SmtpError::Protocol { stage, reply })
    }
}
