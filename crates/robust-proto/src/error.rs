//! Parse errors for the IRC protocol.

use thiserror::Error;

/// Errors produced while parsing an IRC line.
///
/// These are never fatal to the server: the interpreter surfaces them to the
/// offending session as a NOTICE and continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    #[error("message of {0} bytes exceeds the 512 byte limit")]
    TooLong(usize),

    #[error("missing command")]
    MissingCommand,

    #[error("command {0:?} is not alphanumeric")]
    InvalidCommand(String),

    #[error("more than {} parameters", crate::message::MAX_PARAMS)]
    TooManyParams,
}
