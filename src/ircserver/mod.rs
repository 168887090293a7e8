//! The in-memory IRC state machine.
//!
//! [`IrcServer`] is the deterministic core of the node: given the same
//! sequence of committed records, two fresh instances end up byte-identical,
//! including iteration order of every container. All maps are ordered; the
//! only time source is the record timestamp passed into each mutator.
//!
//! The FSM driver is the sole writer. Everything else reads through the
//! shared lock around the whole aggregate.

pub mod channel;
pub mod commands;
pub mod session;

use std::collections::{BTreeMap, BTreeSet};

use robust_proto::{irc_to_lower, Message};
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::types::{RobustId, RobustMessage, RobustType};

pub use channel::{Channel, ListEntry, MemberModes, Topic};
pub use session::{Phase, Session, SessionId};

/// One output line together with the sessions that must observe it.
///
/// For a numeric reply the set holds only the originating session; for a
/// channel broadcast it holds the member set at the apply point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub msg: Message,
    pub interested: BTreeSet<SessionId>,
}

impl Reply {
    pub fn to_session(session: SessionId, msg: Message) -> Reply {
        let mut interested = BTreeSet::new();
        interested.insert(session);
        Reply { msg, interested }
    }
}

/// The replicated IRC state: sessions, channels and network config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrcServer {
    /// Network name, used as the server prefix of every emitted line.
    pub server_name: String,
    /// Timestamp (nanoseconds) of the first applied record; shown in the
    /// 003 reply. Replicated so the welcome burst is identical on all nodes.
    pub server_created: i64,
    pub sessions: BTreeMap<SessionId, Session>,
    /// Keyed by casefolded channel name.
    pub channels: BTreeMap<String, Channel>,
    pub config: NetworkConfig,
    /// Id of the last applied input record; guards idempotent re-apply.
    pub last_processed: RobustId,
}

impl IrcServer {
    pub fn new(server_name: &str) -> IrcServer {
        IrcServer {
            server_name: server_name.to_string(),
            server_created: 0,
            sessions: BTreeMap::new(),
            channels: BTreeMap::new(),
            config: NetworkConfig::default(),
            last_processed: RobustId::default(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn session_by_id(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Find the live session owning a nickname, under RFC 1459 folding.
    pub fn session_by_nick(&self, nick: &str) -> Option<&Session> {
        let folded = irc_to_lower(nick);
        self.sessions
            .values()
            .find(|s| s.phase != Phase::Quit && !s.nick.is_empty() && irc_to_lower(&s.nick) == folded)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&irc_to_lower(name))
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn session_limit(&self) -> u64 {
        self.config.session_limit
    }

    pub fn channel_limit(&self) -> u64 {
        self.config.channel_limit
    }

    // ------------------------------------------------------------------
    // Control-record mutators (called by the FSM driver only)
    // ------------------------------------------------------------------

    /// Apply a CreateSession record.
    pub fn create_session(&mut self, id: SessionId, remote_addr: &str, now: i64) -> Result<()> {
        if self.sessions.len() as u64 >= self.config.session_limit {
            return Err(Error::SessionLimit);
        }
        self.sessions
            .insert(id, Session::new(id, remote_addr.to_string(), now));
        Ok(())
    }

    /// Apply a DeleteSession record.
    ///
    /// Broadcasts a QUIT to every session sharing a channel (this is how
    /// expired sessions become visible as gone) and removes all state owned
    /// by the session. Deleting an unknown session is a no-op so re-applied
    /// records stay harmless.
    pub fn delete_session(&mut self, id: SessionId, reason: &str, _now: i64) -> Vec<Reply> {
        let session = match self.sessions.get(&id) {
            Some(session) => session.clone(),
            None => return Vec::new(),
        };

        let mut replies = Vec::new();
        let mates = self.channel_mates(id);
        if !mates.is_empty() {
            let quit = Message::new("QUIT", Vec::<String>::new())
                .with_trailing(reason)
                .with_prefix(session.prefix());
            replies.push(Reply {
                msg: quit,
                interested: mates,
            });
        }
        for channel in session.channels.iter() {
            self.remove_member(channel, id);
        }
        self.sessions.remove(&id);
        replies
    }

    /// Sessions idle beyond the expiration TTL, as DeleteSession proposals.
    ///
    /// Called by the leader-only expiry loop; ids are assigned at commit.
    pub fn expire_sessions(&self, now: i64) -> Vec<RobustMessage> {
        let ttl = self.config.session_expiration_nanos();
        self.sessions
            .values()
            .filter(|s| now - s.last_activity > ttl)
            .map(|s| {
                RobustMessage::new(
                    RobustType::DeleteSession,
                    s.id.0,
                    "Ping timeout".to_string(),
                    now,
                )
            })
            .collect()
    }

    /// Swap in a new network config from a committed Config record.
    pub fn apply_config(&mut self, data: &str) {
        match NetworkConfig::from_toml(data) {
            Ok(config) => self.config = config,
            // Keeping the old config on a bad document is deterministic;
            // every node sees the same bytes.
            Err(e) => tracing::warn!(error = %e, "ignoring unparsable config record"),
        }
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// All sessions sharing at least one channel with `id`, excluding `id`.
    pub fn channel_mates(&self, id: SessionId) -> BTreeSet<SessionId> {
        let mut mates = BTreeSet::new();
        if let Some(session) = self.sessions.get(&id) {
            for name in &session.channels {
                if let Some(channel) = self.channels.get(name) {
                    mates.extend(channel.member_ids());
                }
            }
        }
        mates.remove(&id);
        mates
    }

    /// Remove a member from a channel, destroying the channel when empty.
    pub(crate) fn remove_member(&mut self, folded_name: &str, id: SessionId) {
        let empty = match self.channels.get_mut(folded_name) {
            Some(channel) => {
                channel.members.remove(&id);
                channel.members.is_empty()
            }
            None => false,
        };
        if empty {
            self.channels.remove(folded_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_sessions(n: u64) -> IrcServer {
        let mut server = IrcServer::new("robustirc.net");
        for i in 1..=n {
            server.create_session(SessionId(i), "10.0.0.1:1", i as i64).unwrap();
        }
        server
    }

    #[test]
    fn test_session_limit() {
        let mut server = server_with_sessions(0);
        server.config.session_limit = 1;
        server.create_session(SessionId(1), "a", 1).unwrap();
        assert!(matches!(
            server.create_session(SessionId(2), "b", 2),
            Err(Error::SessionLimit)
        ));
    }

    #[test]
    fn test_session_by_nick_casefolded() {
        let mut server = server_with_sessions(1);
        server.sessions.get_mut(&SessionId(1)).unwrap().nick = "Mero[1]".into();
        assert!(server.session_by_nick("mero{1}").is_some());
        assert!(server.session_by_nick("other").is_none());
    }

    #[test]
    fn test_delete_unknown_session_is_noop() {
        let mut server = server_with_sessions(0);
        assert!(server.delete_session(SessionId(7), "gone", 1).is_empty());
    }

    #[test]
    fn test_expire_sessions() {
        let mut server = server_with_sessions(2);
        server.config.session_expiration_secs = 1;
        let now = 5_000_000_000;
        server.sessions.get_mut(&SessionId(2)).unwrap().last_activity = now;
        let expired = server.expire_sessions(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session, 1);
        assert_eq!(expired[0].kind, RobustType::DeleteSession);
    }
}
