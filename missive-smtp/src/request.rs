//! The immutable description of one delivery attempt.

use std::{fmt, time::Duration};

use missive_common::config::{Config, SecurityMode};

use crate::{
    error::{Result, SmtpError},
    message::{self, Attachment},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_HELO_NAME: &str = "localhost";

/// AUTH LOGIN username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to submit one message. Build with
/// [`DeliveryRequest::builder`] or [`DeliveryRequest::from_config`].
///
/// ```no_run
/// use std::time::Duration;
/// use missive_smtp::DeliveryRequest;
///
/// # fn example() -> missive_smtp::Result<()> {
/// let request = DeliveryRequest::builder("mail.example.com", 587)
///     .credentials("enquiries", "hunter2")
///     .from("noreply@example.com")
///     .to("sales@example.com")
///     .subject("New enquiry")
///     .body("Hello")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    host: String,
    port: u16,
    security: SecurityMode,
    credentials: Option<Credentials>,
    helo_name: String,
    from: String,
    to: Vec<String>,
    reply_to: Option<String>,
    subject: String,
    body: String,
    attachments: Vec<Attachment>,
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl DeliveryRequest {
    #[must_use]
    pub fn builder(host: impl Into<String>, port: u16) -> DeliveryRequestBuilder {
        DeliveryRequestBuilder {
            request: Self {
                host: host.into(),
                port,
                security: SecurityMode::default(),
                credentials: None,
                helo_name: DEFAULT_HELO_NAME.to_string(),
                from: String::new(),
                to: Vec::new(),
                reply_to: None,
                subject: String::new(),
                body: String::new(),
                attachments: Vec::new(),
                timeout: DEFAULT_TIMEOUT,
                accept_invalid_certs: false,
            },
        }
    }

    /// A builder seeded from the configuration file: relay, security,
    /// credentials, sender and default recipients.
    #[must_use]
    pub fn from_config(config: &Config) -> DeliveryRequestBuilder {
        let smtp = &config.smtp;
        let mut builder = Self::builder(&smtp.host, smtp.port())
            .security(smtp.security)
            .helo_name(&smtp.helo_name)
            .timeout(smtp.timeout())
            .accept_invalid_certs(smtp.accept_invalid_certs)
            .from(&config.message.from)
            .recipients(config.message.to.iter().cloned());

        if let Some((username, password)) = smtp.credentials() {
            builder = builder.credentials(username, password);
        }
        if let Some(reply_to) = &config.message.reply_to {
            builder = builder.reply_to(reply_to);
        }

        builder
    }

    /// Checks the request before any socket is opened.
    ///
    /// # Errors
    ///
    /// Returns [`SmtpError::InvalidRequest`] if there are no recipients, an
    /// address or the EHLO name would corrupt a command line, a base64
    /// attachment does not decode, or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be non-zero"));
        }
        if self.helo_name.is_empty() || self.helo_name.contains(char::is_whitespace) {
            return Err(invalid(format!("invalid EHLO name {:?}", self.helo_name)));
        }

        check_address("sender", &self.from)?;
        if self.to.is_empty() {
            return Err(invalid("at least one recipient is required"));
        }
        for recipient in &self.to {
            check_address("recipient", recipient)?;
        }
        if let Some(reply_to) = &self.reply_to {
            check_address("reply-to", reply_to)?;
        }

        if let Some(attachment) = self.attachments.iter().find(|a| !a.payload_is_valid()) {
            return Err(invalid(format!(
                "attachment {:?} is not valid base64",
                attachment.filename
            )));
        }

        Ok(())
    }

    /// Renders the message document sent after `DATA`.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        message::build(
            &self.from,
            &self.to,
            self.reply_to.as_deref(),
            &self.subject,
            &self.body,
            &self.attachments,
        )
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn security(&self) -> SecurityMode {
        self.security
    }

    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn helo_name(&self) -> &str {
        &self.helo_name
    }

    #[must_use]
    pub fn from_address(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.to
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }
}

fn invalid(reason: impl Into<String>) -> SmtpError {
    SmtpError::InvalidRequest(reason.into())
}

fn check_address(role: &str, address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(invalid(format!("{role} address must not be empty")));
    }
    if address.contains(|c: char| matches!(c, '<' | '>') || c.is_whitespace()) {
        return Err(invalid(format!("{role} address {address:?} is malformed")));
    }
    Ok(())
}

/// Fluent builder for [`DeliveryRequest`].
#[derive(Debug, Clone)]
pub struct DeliveryRequestBuilder {
    request: DeliveryRequest,
}

impl DeliveryRequestBuilder {
    #[must_use]
    pub const fn security(mut self, security: SecurityMode) -> Self {
        self.request.security = security;
        self
    }

    /// Enables AUTH LOGIN. An empty username or password leaves it disabled.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let credentials = Credentials::new(username, password);
        self.request.credentials = (!credentials.username.is_empty()
            && !credentials.password.is_empty())
        .then_some(credentials);
        self
    }

    #[must_use]
    pub fn helo_name(mut self, helo_name: impl Into<String>) -> Self {
        self.request.helo_name = helo_name.into();
        self
    }

    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.request.from = address.into();
        self
    }

    /// Adds one recipient.
    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.request.to.push(address.into());
        self
    }

    /// Adds several recipients.
    #[must_use]
    pub fn recipients<I, A>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.request.to.extend(addresses.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.request.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.request.subject = subject.into();
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.request.body = body.into();
        self
    }

    #[must_use]
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.request.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn attachments(mut self, attachments: impl IntoIterator<Item = Attachment>) -> Self {
        self.request.attachments.extend(attachments);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = timeout;
        self
    }

    /// **SECURITY WARNING**: disables certificate verification.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.request.accept_invalid_certs = accept;
        self
    }

    /// Validates and returns the request.
    ///
    /// # Errors
    ///
    /// See [`DeliveryRequest::validate`].
    pub fn build(self) -> Result<DeliveryRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}
