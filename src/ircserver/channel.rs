//! Channel state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::session::SessionId;

/// An entry in a mask list (bans, invite exceptions).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub mask: String,
    pub set_by: String,
    /// Nanoseconds.
    pub set_at: i64,
}

/// Channel topic with metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    /// Nanoseconds.
    pub set_at: i64,
}

/// Per-member channel modes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberModes {
    /// +o (@)
    pub op: bool,
    /// +v (+)
    pub voice: bool,
}

impl MemberModes {
    /// The NAMES/WHO prefix character, highest first.
    pub fn prefix_char(&self) -> Option<char> {
        if self.op {
            Some('@')
        } else if self.voice {
            Some('+')
        } else {
            None
        }
    }

    pub fn can_speak_when_moderated(&self) -> bool {
        self.op || self.voice
    }
}

/// One channel.
///
/// Channels are created lazily on the first JOIN and destroyed when the last
/// member leaves. The member map is ordered by session id, which fixes the
/// iteration order for NAMES, WHO and broadcasts on every node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Display-case name as first joined.
    pub name: String,
    pub topic: Option<Topic>,
    /// Flag modes without arguments: s t i n m.
    pub modes: BTreeSet<char>,
    /// +k
    pub key: Option<String>,
    /// +l
    pub limit: Option<usize>,
    pub members: BTreeMap<SessionId, MemberModes>,
    pub bans: Vec<ListEntry>,
    pub invites: Vec<ListEntry>,
}

impl Channel {
    pub fn new(name: String) -> Channel {
        Channel {
            name,
            ..Channel::default()
        }
    }

    pub fn has_mode(&self, flag: char) -> bool {
        self.modes.contains(&flag)
    }

    /// The member session ids, in iteration order.
    pub fn member_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.members.keys().copied()
    }

    /// Parameters for a 324 mode query reply: the flag string followed by
    /// the key and limit arguments, if set.
    pub fn mode_params(&self) -> Vec<String> {
        let mut flags = String::from("+");
        for flag in &self.modes {
            flags.push(*flag);
        }
        if self.key.is_some() {
            flags.push('k');
        }
        if self.limit.is_some() {
            flags.push('l');
        }
        let mut params = vec![flags];
        if let Some(key) = &self.key {
            params.push(key.clone());
        }
        if let Some(limit) = self.limit {
            params.push(limit.to_string());
        }
        params
    }

    /// Current flag modes as a `+`-prefixed string, with key and limit
    /// arguments appended.
    pub fn mode_string(&self) -> String {
        self.mode_params().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_char() {
        let mut modes = MemberModes::default();
        assert_eq!(modes.prefix_char(), None);
        modes.voice = true;
        assert_eq!(modes.prefix_char(), Some('+'));
        modes.op = true;
        assert_eq!(modes.prefix_char(), Some('@'));
    }

    #[test]
    fn test_mode_string() {
        let mut channel = Channel::new("#test".into());
        channel.modes.insert('n');
        channel.modes.insert('t');
        assert_eq!(channel.mode_string(), "+nt");
        channel.key = Some("sekrit".into());
        channel.limit = Some(25);
        assert_eq!(channel.mode_string(), "+ntkl sekrit 25");
    }

    #[test]
    fn test_member_order_is_session_order() {
        let mut channel = Channel::new("#test".into());
        channel.members.insert(SessionId(9), MemberModes::default());
        channel.members.insert(SessionId(1), MemberModes::default());
        channel.members.insert(SessionId(5), MemberModes::default());
        let ids: Vec<_> = channel.member_ids().collect();
        assert_eq!(ids, vec![SessionId(1), SessionId(5), SessionId(9)]);
    }
}
