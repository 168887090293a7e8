//! IRC message prefixes.
//!
//! A prefix identifies the origin of a message: either a server name or a
//! `nick!user@host` mask.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The origin of an IRC message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Prefix {
    /// A server name such as `robustirc.net`.
    ServerName(String),
    /// A user origin: (nickname, username, hostname).
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string without validating the components.
    ///
    /// A name containing a dot before any `!` or `@` is taken to be a server
    /// name; anything else is a user mask with possibly empty user and host
    /// parts.
    pub fn parse(s: &str) -> Self {
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Part {
            Name,
            User,
            Host,
        }

        let mut name = String::new();
        let mut user = String::new();
        let mut host = String::new();
        let mut part = Part::Name;
        let mut is_server = false;

        for c in s.chars() {
            if c == '.' && part == Part::Name {
                is_server = true;
            }
            match c {
                '!' if part == Part::Name => {
                    is_server = false;
                    part = Part::User;
                }
                '@' if part != Part::Host => {
                    is_server = false;
                    part = Part::Host;
                }
                _ => {
                    match part {
                        Part::Name => &mut name,
                        Part::User => &mut user,
                        Part::Host => &mut host,
                    }
                    .push(c);
                }
            }
        }

        if is_server {
            Prefix::ServerName(name)
        } else {
            Prefix::Nickname(name, user, host)
        }
    }

    /// The nickname component, if this is a user prefix.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) => Some(nick),
            Prefix::ServerName(_) => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => write!(f, "{}", name),
            Prefix::Nickname(nick, user, host) => {
                write!(f, "{}", nick)?;
                if !user.is_empty() {
                    write!(f, "!{}", user)?;
                }
                if !host.is_empty() {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}
