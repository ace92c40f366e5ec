//! Transport security policy for an SMTP submission.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// TLS from the first byte (usually port 465). STARTTLS is never issued.
    Implicit,

    /// Plaintext, upgraded with STARTTLS when the server advertises it.
    #[default]
    Opportunistic,

    /// Plaintext, upgraded with STARTTLS. Delivery fails if the server does
    /// not advertise it or the handshake does not complete.
    Required,

    /// Plaintext only, STARTTLS is never attempted.
    ///
    /// **WARNING**: credentials travel in the clear. Local test relays only.
    Disabled,
}

impl SecurityMode {
    /// Returns `true` if the socket must be wrapped in TLS before the greeting.
    #[must_use]
    pub const fn is_implicit(self) -> bool {
        matches!(self, Self::Implicit)
    }

    /// Returns `true` if STARTTLS may be issued in this mode.
    #[must_use]
    pub const fn allows_starttls(self) -> bool {
        matches!(self, Self::Opportunistic | Self::Required)
    }

    /// Returns `true` if the delivery must fail without a STARTTLS upgrade.
    #[must_use]
    pub const fn requires_starttls(self) -> bool {
        matches!(self, Self::Required)
    }

    /// The conventional submission port for this mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 465,
            Self::Opportunistic | Self::Required => 587,
            Self::Disabled => 25,
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Implicit => "implicit",
            Self::Opportunistic => "opportunistic",
            Self::Required => "required",
            Self::Disabled => "disabled",
        })
    }
}
