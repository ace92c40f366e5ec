//! Command-line front end: merges the configuration file with the command
//! line into one [`DeliveryRequest`] and submits it.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{ArgGroup, Parser};
use missive_common::config::{self, Config, SecurityMode};
use missive_smtp::{Attachment, DeliveryRequest, Receipt, SmtpError, deliver};

/// Submit one message to the SMTP relay named in the configuration file
#[derive(Parser, Debug)]
#[command(name = "missive", version, long_about = None)]
#[command(group(ArgGroup::new("content").required(true).args(["body", "body_file"])))]
pub struct Cli {
    /// Configuration file (otherwise `MISSIVE_CONFIG`, ./missive.toml, /etc/missive/missive.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub subject: String,

    /// Plain-text body
    #[arg(short, long)]
    pub body: Option<String>,

    /// Read the plain-text body from a file
    #[arg(long)]
    pub body_file: Option<PathBuf>,

    /// Extra recipient, added to those in the configuration file
    #[arg(short, long = "to", value_name = "ADDRESS")]
    pub to: Vec<String>,

    /// File to attach
    #[arg(short, long = "attach", value_name = "PATH")]
    pub attach: Vec<PathBuf>,

    /// Overrides the configured Reply-To
    #[arg(long, value_name = "ADDRESS")]
    pub reply_to: Option<String>,
}

/// Locates and loads the configuration file.
///
/// # Errors
///
/// Returns an error if no file can be found or it is invalid.
pub fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let from_env = std::env::var_os(config::CONFIG_ENV_VAR).map(PathBuf::from);
    let path = config::locate(explicit, from_env.as_deref())?;
    tracing::debug!(path = %path.display(), "Using configuration file");

    Ok(Config::load(&path)?)
}

/// Builds the request from the configuration and command line.
///
/// # Errors
///
/// Returns an error if the body or an attachment cannot be read, or the
/// resulting request is invalid.
pub async fn request(cli: Cli, config: &Config) -> anyhow::Result<DeliveryRequest> {
    let body = match (cli.body, &cli.body_file) {
        (Some(body), _) => body,
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read body from {}", path.display()))?,
        (None, None) => String::new(),
    };

    let mut attachments = Vec::with_capacity(cli.attach.len());
    for path in &cli.attach {
        attachments.push(Attachment::from_path(path).await?);
    }

    let mut builder = DeliveryRequest::from_config(config)
        .recipients(cli.to)
        .subject(cli.subject)
        .body(body)
        .attachments(attachments);
    if let Some(reply_to) = cli.reply_to {
        builder = builder.reply_to(reply_to);
    }

    Ok(builder.build()?)
}

/// Loads everything and performs the delivery.
///
/// # Errors
///
/// Returns the delivery failure, with a hint attached where a common
/// misconfiguration is the likely cause.
pub async fn run(cli: Cli) -> anyhow::Result<Receipt> {
    let config = load_config(cli.config.as_deref())?;
    let request = request(cli, &config).await?;
    let target = format!("{}:{}", request.host(), request.port());

    match deliver(&request).await {
        Ok(receipt) => Ok(receipt),
        Err(err) => {
            let message = match hint(&err, request.security(), request.port()) {
                Some(hint) => format!("Delivery via {target} failed. {hint}"),
                None => format!("Delivery via {target} failed"),
            };
            Err(anyhow::Error::new(err).context(message))
        }
    }
}

/// Suggests a fix for failures that usually mean the security mode does not
/// match what the port speaks.
///
/// A relay expecting implicit TLS waits for a ClientHello and never greets a
/// plaintext client, so that mismatch surfaces as a timeout.
pub const fn hint(err: &SmtpError, security: SecurityMode, port: u16) -> Option<&'static str> {
    match (err, security) {
        (SmtpError::Timeout(_), security)
            if !security.is_implicit() && port == SecurityMode::Implicit.default_port() =>
        {
            Some("Port 465 normally expects TLS from the first byte; try security = \"implicit\"")
        }
        (SmtpError::Connection { .. }, SecurityMode::Implicit) => Some(
            "The relay may not speak TLS on this port; try security = \"opportunistic\" or port 587",
        ),
        (SmtpError::MalformedReply(_) | SmtpError::ConnectionClosed, security)
            if !security.is_implicit() =>
        {
            Some(
                "The relay may expect TLS from the first byte; try security = \"implicit\"",
            )
        }
        (SmtpError::TlsUpgrade(_), SecurityMode::Required) => Some(
            "The relay did not offer a usable STARTTLS; check the port or use security = \"implicit\"",
        ),
        _ => None,
    }
}
