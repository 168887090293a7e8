//! The FSM driver: the single writer of IRC state and output stream.
//!
//! The raft library calls `apply` in committed-index order on every node,
//! leader included, from one serialized context. Everything in here must be
//! deterministic and must tolerate duplicate applies: after a snapshot
//! restore the library may replay entries the node has already seen.

use std::io::Read;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::error::Result;
use crate::ircserver::{IrcServer, SessionId};
use crate::metrics;
use crate::outputstream::{OutputRecord, OutputStream};
use crate::raft::snapshot::SnapshotData;
use crate::raft::LogEntry;
use crate::types::{RobustId, RobustMessage, RobustType};

pub struct RobustFsm {
    /// Exclusive lock held only for the duration of one apply; status
    /// readers take it shared and never across a blocking wait.
    server: RwLock<IrcServer>,
    output: Arc<OutputStream>,
}

impl RobustFsm {
    pub fn new(network_name: &str, output: Arc<OutputStream>) -> RobustFsm {
        RobustFsm {
            server: RwLock::new(IrcServer::new(network_name)),
            output,
        }
    }

    /// Shared read access for status endpoints and tests.
    pub fn server(&self) -> RwLockReadGuard<'_, IrcServer> {
        self.server.read().expect("irc state lock poisoned")
    }

    pub fn output(&self) -> &OutputStream {
        &self.output
    }

    pub fn last_applied(&self) -> u64 {
        self.server().last_processed.id
    }

    /// DeleteSession proposals for every session idle beyond the TTL.
    pub fn expire_sessions(&self, now: i64) -> Vec<RobustMessage> {
        self.server().expire_sessions(now)
    }

    /// Apply one committed entry.
    pub fn apply(&self, entry: &LogEntry) -> Result<()> {
        let msg = match RobustMessage::decode(&entry.data) {
            Ok(msg) => msg,
            Err(e) => {
                // A malformed committed record is skipped, identically on
                // every node; aborting here would wedge the whole cluster.
                tracing::error!(index = entry.index, error = %e, "skipping malformed record");
                metrics::APPLIED_MESSAGES.with_label_values(&["malformed"]).inc();
                return Ok(());
            }
        };
        metrics::APPLIED_MESSAGES
            .with_label_values(&[msg.kind.as_label()])
            .inc();

        let mut server = self.server.write().expect("irc state lock poisoned");
        if entry.index <= server.last_processed.id {
            tracing::debug!(index = entry.index, "skipping duplicate apply");
            return Ok(());
        }
        if server.server_created == 0 {
            server.server_created = msg.timestamp;
        }

        let session = SessionId(msg.session);
        let replies = match msg.kind {
            RobustType::CreateSession => {
                match server.create_session(SessionId(entry.index), &msg.data, msg.timestamp) {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(index = entry.index, error = %e, "session not created");
                        Vec::new()
                    }
                }
            }
            RobustType::DeleteSession => {
                let reason = if msg.data.is_empty() {
                    "Connection closed"
                } else {
                    &msg.data
                };
                server.delete_session(session, reason, msg.timestamp)
            }
            RobustType::IrcFromClient => {
                if let Some(live) = server.sessions.get_mut(&session) {
                    live.last_seen = RobustId::new(entry.index, 0);
                }
                server.process_message(session, &msg.data, msg.timestamp)
            }
            RobustType::IrcToClient => {
                // Output ids never appear in the input log.
                tracing::error!(index = entry.index, "IRCToClient record in input log, skipping");
                Vec::new()
            }
            RobustType::Config => {
                server.apply_config(&msg.data);
                Vec::new()
            }
            RobustType::Ping => Vec::new(),
        };
        server.last_processed = RobustId::new(entry.index, 0);

        metrics::SESSIONS.set(server.num_sessions() as i64);
        metrics::CHANNELS.set(server.num_channels() as i64);
        metrics::SESSION_LIMIT.set(server.session_limit() as i64);
        metrics::CHANNEL_LIMIT.set(server.channel_limit() as i64);
        drop(server);

        let records: Vec<OutputRecord> = replies
            .into_iter()
            .enumerate()
            .map(|(i, reply)| OutputRecord {
                id: RobustId::new(entry.index, i as u64 + 1),
                line: reply.msg.to_string(),
                interested: reply.interested,
            })
            .collect();
        self.output.append(&records)
    }

    /// A point-in-time copy of the whole state.
    ///
    /// The copy happens synchronously under the lock; serializing the
    /// returned value on another task never observes later applies.
    pub fn snapshot(&self) -> SnapshotData {
        SnapshotData {
            server: self.server().clone(),
            output: self.output.tail(),
        }
    }

    /// Replace all state from a snapshot reader.
    pub fn restore<R: Read>(&self, reader: R) -> Result<()> {
        let snapshot = SnapshotData::decode(reader)?;
        self.restore_snapshot(snapshot)
    }

    pub fn restore_snapshot(&self, snapshot: SnapshotData) -> Result<()> {
        *self.server.write().expect("irc state lock poisoned") = snapshot.server;
        self.output.restore(snapshot.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RobustType;

    const NOW: i64 = 1_700_000_000_000_000_000;

    fn fsm() -> (tempfile::TempDir, RobustFsm) {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = Arc::new(OutputStream::open(dir.path()).expect("open"));
        (dir, RobustFsm::new("robustirc.net", output))
    }

    fn entry(index: u64, msg: &RobustMessage) -> LogEntry {
        LogEntry {
            index,
            data: msg.encode(),
        }
    }

    #[test]
    fn test_create_session_uses_committed_index() {
        let (_dir, fsm) = fsm();
        let msg = RobustMessage::new(RobustType::CreateSession, 0, "10.0.0.1:1".into(), NOW);
        fsm.apply(&entry(7, &msg)).unwrap();
        assert!(fsm.server().session_by_id(SessionId(7)).is_some());
        assert_eq!(fsm.last_applied(), 7);
    }

    #[test]
    fn test_duplicate_apply_is_noop() {
        let (_dir, fsm) = fsm();
        let create = RobustMessage::new(RobustType::CreateSession, 0, "addr".into(), NOW);
        fsm.apply(&entry(1, &create)).unwrap();
        let nick = RobustMessage::new(RobustType::IrcFromClient, 1, "NICK dup".into(), NOW);
        fsm.apply(&entry(2, &nick)).unwrap();
        let before = fsm.snapshot();

        fsm.apply(&entry(2, &nick)).unwrap();
        let after = fsm.snapshot();
        assert_eq!(before.server, after.server);
        assert_eq!(before.output, after.output);
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let (_dir, fsm) = fsm();
        fsm.apply(&LogEntry {
            index: 1,
            data: b"not json".to_vec(),
        })
        .unwrap();
        assert_eq!(fsm.last_applied(), 0);
    }

    #[test]
    fn test_output_ids_share_index() {
        let (_dir, fsm) = fsm();
        let create = RobustMessage::new(RobustType::CreateSession, 0, "addr".into(), NOW);
        fsm.apply(&entry(1, &create)).unwrap();
        fsm.apply(&entry(
            2,
            &RobustMessage::new(RobustType::IrcFromClient, 1, "NICK a".into(), NOW),
        ))
        .unwrap();
        // USER completes registration: several replies, one index.
        fsm.apply(&entry(
            3,
            &RobustMessage::new(RobustType::IrcFromClient, 1, "USER a 0 * :a".into(), NOW),
        ))
        .unwrap();

        let tail = fsm.output().tail();
        assert!(tail.len() > 2);
        assert!(tail.iter().all(|r| r.id.id == 3));
        let replies: Vec<u64> = tail.iter().map(|r| r.id.reply).collect();
        let expected: Vec<u64> = (1..=tail.len() as u64).collect();
        assert_eq!(replies, expected);
    }

    #[test]
    fn test_config_record_updates_limits() {
        let (_dir, fsm) = fsm();
        let config = RobustMessage::new(
            RobustType::Config,
            0,
            "session_limit = 2\nchannel_limit = 1".into(),
            NOW,
        );
        fsm.apply(&entry(1, &config)).unwrap();
        assert_eq!(fsm.server().session_limit(), 2);
        assert_eq!(fsm.server().channel_limit(), 1);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let (_dir, fsm) = fsm();
        let create = RobustMessage::new(RobustType::CreateSession, 0, "addr".into(), NOW);
        fsm.apply(&entry(1, &create)).unwrap();
        fsm.apply(&entry(
            2,
            &RobustMessage::new(RobustType::IrcFromClient, 1, "NICK mero".into(), NOW),
        ))
        .unwrap();

        let snapshot = fsm.snapshot();
        let encoded = snapshot.encode();

        let (_dir2, other) = self::fsm();
        other.restore(encoded.as_slice()).unwrap();
        assert_eq!(other.snapshot().encode(), encoded);
    }
}
