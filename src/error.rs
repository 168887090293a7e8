//! Unified error handling for robustircd.
//!
//! One hierarchy covers the whole node. Interpreter-level failures never
//! reach this type: they are absorbed into IRC numerics inside the state
//! machine. Everything here is either surfaced over HTTP (NotLeader, Timeout,
//! AuthFailed, ...) or fatal to the process (StorageIo, SnapshotCorrupt).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Node-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A log record failed to decode. Rejected on submit, skipped on apply.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// An IRC line failed to parse. Surfaced to the session as a NOTICE.
    #[error("irc parse error: {0}")]
    IrcParse(#[from] robust_proto::ParseError),

    /// A write reached a node that is not the raft leader.
    #[error("not the leader")]
    NotLeader {
        /// host:port of the current leader, if known.
        leader: Option<String>,
    },

    /// A proposed record was not committed within the wait window.
    #[error("timed out waiting for the message to be committed")]
    Timeout,

    /// A blocking read was cancelled by the caller going away.
    #[error("cancelled")]
    Cancelled,

    /// A record referenced a session that does not exist (anymore).
    #[error("no such session: {0}")]
    SessionUnknown(u64),

    /// The network-wide session limit is reached.
    #[error("session limit reached")]
    SessionLimit,

    /// The network-wide channel limit is reached.
    #[error("channel limit reached")]
    ChannelLimit,

    /// The request did not carry the correct network password.
    #[error("network password rejected")]
    AuthFailed,

    /// The key-value store failed. Fatal; the supervisor restarts the node.
    #[error("storage error: {0}")]
    StorageIo(String),

    /// A snapshot could not be decoded. Fatal.
    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// The local clock disagrees with the network at bootstrap.
    #[error("clock skew detected: {0}")]
    TimeSkew(String),
}

impl Error {
    /// Wrap any storage-layer failure.
    ///
    /// The redb API surfaces several distinct error types; they are all fatal
    /// to us in the same way, so they collapse into one kind here.
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Error::StorageIo(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageIo(err.to_string())
    }
}
