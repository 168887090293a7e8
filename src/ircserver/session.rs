//! Session state.
//!
//! A session is a persistent client identity that survives reconnects of the
//! bridge. It is created by a CreateSession record, destroyed by a
//! DeleteSession record, and identified by the committed index of its
//! CreateSession record.

use std::collections::BTreeSet;
use std::fmt;

use robust_proto::Prefix;
use serde::{Deserialize, Serialize};

use crate::types::RobustId;

/// Opaque session handle: the committed index of the CreateSession record.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Registration phase of a session.
///
/// Commands that are illegal in a phase produce 451 or 462; `Quit` is
/// terminal and discards further input after a deterministic warning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Unregistered,
    /// PASS was received.
    Authenticating,
    /// NICK or USER was received, the other is still missing.
    Registering,
    Registered,
    /// QUIT was processed; the session lingers until DeleteSession commits.
    Quit,
}

/// One client identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub phase: Phase,

    /// Display-case nickname; empty until NICK.
    pub nick: String,
    pub username: String,
    pub realname: String,
    /// Connection password from PASS.
    pub password: String,

    pub operator: bool,
    pub away: Option<String>,
    /// User mode flags.
    pub modes: BTreeSet<char>,
    /// Casefolded names of joined channels.
    pub channels: BTreeSet<String>,
    /// Casefolded names of channels this session was invited to.
    pub invited_to: BTreeSet<String>,

    /// Nanoseconds; the CreateSession record timestamp.
    pub created: i64,
    /// Nanoseconds; updated on every record from this session.
    pub last_activity: i64,
    /// Id of the newest input record this session sent.
    pub last_seen: RobustId,
    /// Remote address of the bridge, informational only.
    pub remote_addr: String,
}

impl Session {
    pub fn new(id: SessionId, remote_addr: String, created: i64) -> Session {
        Session {
            id,
            created,
            last_activity: created,
            remote_addr,
            ..Session::default()
        }
    }

    /// The `nick!user@host` origin of messages from this session.
    ///
    /// The host is derived from the session id, not the client address, so
    /// it is identical on every node.
    pub fn prefix(&self) -> Prefix {
        Prefix::Nickname(
            self.nick.clone(),
            format!("~{}", self.username),
            format!("robust/{}", self.id),
        )
    }

    /// The nick to address replies to, `*` before NICK.
    pub fn nick_or_star(&self) -> &str {
        if self.nick.is_empty() {
            "*"
        } else {
            &self.nick
        }
    }

    pub fn registered(&self) -> bool {
        self.phase == Phase::Registered
    }
}
