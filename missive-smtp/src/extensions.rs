//! Service extensions advertised in an EHLO reply.

use crate::reply::Reply;

/// What the server said it supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    starttls: bool,
    auth: Option<Vec<String>>,
    size: Option<usize>,
    eight_bit_mime: bool,
    other: Vec<String>,
}

impl Extensions {
    /// Reads every line of an EHLO reply. Keywords are case-insensitive.
    ///
    /// The first line is conventionally the server's domain, but it is
    /// inspected like the rest: some servers put a keyword there.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut extensions = Self::default();

        for message in reply.messages() {
            let mut words = message.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => extensions.starttls = true,
                "AUTH" => extensions
                    .auth
                    .get_or_insert_with(Vec::new)
                    .extend(words.map(str::to_ascii_uppercase)),
                "SIZE" => {
                    extensions.size = words.next().and_then(|limit| limit.parse().ok());
                }
                "8BITMIME" => extensions.eight_bit_mime = true,
                _ => extensions.other.push(message.to_string()),
            }
        }

        extensions
    }

    #[must_use]
    pub const fn starttls(&self) -> bool {
        self.starttls
    }

    /// `None` when no AUTH line was advertised at all.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Option<&[String]> {
        self.auth.as_deref()
    }

    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth
            .as_ref()
            .is_some_and(|mechanisms| mechanisms.iter().any(|m| m.eq_ignore_ascii_case(mechanism)))
    }

    /// Advertised message size limit; `Some(0)` means "no fixed limit".
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        self.size
    }

    #[must_use]
    pub const fn eight_bit_mime(&self) -> bool {
        self.eight_bit_mime
    }

    /// Lines that were not recognised, verbatim.
    #[must_use]
    pub fn other(&self) -> &[String] {
        &self.other
    }
}
