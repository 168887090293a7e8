//! IRC message parsing and serialization.
//!
//! A message is `[:prefix] COMMAND [params] [:trailing]`, at most 512 bytes
//! including the trailing CR-LF. The trailing parameter is stored as the last
//! element of `params`, with a flag recording that it must be re-emitted with
//! a leading `:` so that lines round-trip byte-identically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::prefix::Prefix;
use crate::response::Response;

/// Maximum length of a single IRC line, in bytes, including the CR-LF
/// terminator.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of parameters in a single message, trailing included.
pub const MAX_PARAMS: usize = 15;

/// A parsed IRC message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message origin, set on everything the server emits.
    pub prefix: Option<Prefix>,
    /// The verb, normalized to ASCII uppercase on parse.
    pub command: String,
    /// Parameters; the trailing parameter, if any, is the last element.
    pub params: Vec<String>,
    /// Whether the last parameter is a trailing parameter and must be
    /// serialized with a leading `:` even when it contains no space.
    #[serde(default)]
    pub trailing: bool,
}

impl Message {
    /// Build a message without a prefix or trailing parameter.
    pub fn new<C, P>(command: C, params: P) -> Message
    where
        C: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Message {
            prefix: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
            trailing: false,
        }
    }

    /// Build a numeric reply from a server.
    ///
    /// The final parameter of a numeric is always emitted in trailing form.
    pub fn numeric<P>(server: &str, response: Response, params: P) -> Message
    where
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Message {
            prefix: Some(Prefix::ServerName(server.to_string())),
            command: response.to_string(),
            params: params.into_iter().map(Into::into).collect(),
            trailing: true,
        }
    }

    /// Append a trailing parameter, consuming the message.
    pub fn with_trailing<S: Into<String>>(mut self, text: S) -> Message {
        self.params.push(text.into());
        self.trailing = true;
        self
    }

    /// Attach a prefix, consuming the message.
    pub fn with_prefix(mut self, prefix: Prefix) -> Message {
        self.prefix = Some(prefix);
        self
    }

    /// Nth parameter, if present; the trailing parameter counts as the last.
    pub fn param(&self, n: usize) -> Option<&str> {
        self.params.get(n).map(String::as_str)
    }

    /// Length in bytes of the serialized form, including CR-LF.
    ///
    /// Callers that assemble multi-target replies (NAMES, ISON) use this to
    /// split their output at parameter boundaries below [`MAX_LINE_LEN`].
    pub fn encoded_len(&self) -> usize {
        let mut len = self.command.len() + 2; // CR LF
        if let Some(prefix) = &self.prefix {
            len += 1 + prefix.to_string().len() + 1; // ':' prefix ' '
        }
        for (i, param) in self.params.iter().enumerate() {
            len += 1 + param.len(); // ' ' param
            if i == self.params.len() - 1 && (self.trailing || needs_trailing(param)) {
                len += 1; // ':'
            }
        }
        len
    }
}

/// Whether a final parameter can only be represented in trailing form.
fn needs_trailing(param: &str) -> bool {
    param.is_empty() || param.starts_with(':') || param.contains(' ')
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Message, ParseError> {
        let line = s.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        // The input limit counts the terminator, present or not.
        if line.len() > MAX_LINE_LEN - 2 {
            return Err(ParseError::TooLong(line.len() + 2));
        }

        let mut rest = line;
        let mut prefix = None;

        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, r) = match stripped.split_once(' ') {
                Some(split) => split,
                None => return Err(ParseError::MissingCommand),
            };
            prefix = Some(Prefix::parse(p));
            rest = r.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        if !command.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ParseError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        let mut trailing = false;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(text) = rest.strip_prefix(':') {
                params.push(text.to_string());
                trailing = true;
                break;
            }
            let (param, r) = match rest.split_once(' ') {
                Some(split) => split,
                None => (rest, ""),
            };
            params.push(param.to_string());
            rest = r;
        }
        if params.len() > MAX_PARAMS {
            return Err(ParseError::TooManyParams);
        }

        Ok(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1 && (self.trailing || needs_trailing(param)) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}
