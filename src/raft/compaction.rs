//! Log compaction.
//!
//! Once a snapshot covers the state and the retention window has moved past
//! an input record's outputs, the record's bytes only take up space: it is
//! folded into a minimal Ping placeholder with the same position in the log.
//! Control records (CreateSession, DeleteSession, Config) are always kept,
//! so session identities stay reconstructible from any retained snapshot.
//!
//! Compaction is deterministic in its `now` input: running it twice over the
//! same log with the same `now` produces byte-identical logs, which the
//! canary replay compares across software versions. The
//! `compaction.canary_start` config knob pins `now` for such replays.

use crate::error::Result;
use crate::outputstream::OutputStream;
use crate::raft::storage::RedbLogStore;
use crate::types::{RobustMessage, RobustType};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries older than the horizon that were considered.
    pub examined: u64,
    /// Entries rewritten to placeholders.
    pub folded: u64,
    /// Output records garbage-collected.
    pub deleted_outputs: usize,
}

/// Fold the log and garbage-collect the output stream up to the retention
/// horizon `now - retention_nanos`.
pub fn compact(
    store: &RedbLogStore,
    output: &OutputStream,
    retention_nanos: i64,
    now: i64,
) -> Result<CompactionStats> {
    let horizon = now.saturating_sub(retention_nanos);
    let mut stats = CompactionStats::default();

    let entries = store.entries()?;

    // Everything up to the last entry proposed before the horizon has fully
    // delivered outputs; drop those outputs first.
    let mut cutoff = None;
    for entry in &entries {
        match RobustMessage::decode(&entry.data) {
            Ok(msg) if msg.timestamp < horizon => cutoff = Some(entry.index),
            _ => break,
        }
    }
    if let Some(cutoff) = cutoff {
        stats.deleted_outputs = output.delete_before(cutoff + 1)?;
    }

    for entry in entries {
        let msg = match RobustMessage::decode(&entry.data) {
            Ok(msg) => msg,
            Err(_) => continue,
        };
        if msg.timestamp >= horizon {
            break;
        }
        stats.examined += 1;
        if msg.kind == RobustType::IrcFromClient && !output.contains_input(entry.index) {
            let placeholder = RobustMessage::new(RobustType::Ping, 0, String::new(), msg.timestamp);
            store.replace(entry.index, &placeholder.encode())?;
            stats.folded += 1;
        }
    }

    tracing::info!(
        examined = stats.examined,
        folded = stats.folded,
        deleted_outputs = stats.deleted_outputs,
        "compaction pass finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputstream::OutputStream;
    use crate::raft::LogEntry;

    const HOUR: i64 = 3_600_000_000_000;

    fn setup() -> (tempfile::TempDir, RedbLogStore, OutputStream) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RedbLogStore::open(dir.path()).expect("open store");
        let output = OutputStream::open(dir.path()).expect("open output");
        (dir, store, output)
    }

    fn put(store: &RedbLogStore, index: u64, kind: RobustType, ts: i64) {
        let msg = RobustMessage::new(kind, 1, "PRIVMSG #t :x".into(), ts);
        store.append(&LogEntry { index, data: msg.encode() }).unwrap();
    }

    #[test]
    fn test_old_client_records_fold() {
        let (_dir, store, output) = setup();
        put(&store, 1, RobustType::CreateSession, 0);
        put(&store, 2, RobustType::IrcFromClient, HOUR);
        put(&store, 3, RobustType::IrcFromClient, 10 * HOUR);

        let stats = compact(&store, &output, HOUR, 10 * HOUR).unwrap();
        assert_eq!(stats.folded, 1);

        // The control record survives; the stale client record is a Ping.
        let folded = RobustMessage::decode(&store.get(2).unwrap().unwrap().data).unwrap();
        assert_eq!(folded.kind, RobustType::Ping);
        let kept = RobustMessage::decode(&store.get(1).unwrap().unwrap().data).unwrap();
        assert_eq!(kept.kind, RobustType::CreateSession);
        let recent = RobustMessage::decode(&store.get(3).unwrap().unwrap().data).unwrap();
        assert_eq!(recent.kind, RobustType::IrcFromClient);
    }

    #[test]
    fn test_recent_records_and_outputs_survive() {
        let (_dir, store, output) = setup();
        put(&store, 1, RobustType::IrcFromClient, 5 * HOUR);
        put(&store, 2, RobustType::IrcFromClient, 9 * HOUR);
        output
            .append(&[crate::outputstream::OutputRecord {
                id: crate::types::RobustId::new(2, 1),
                line: "x".into(),
                interested: Default::default(),
            }])
            .unwrap();

        // The horizon sits between the two records.
        let stats = compact(&store, &output, 2 * HOUR, 10 * HOUR).unwrap();
        assert_eq!(stats.folded, 1);
        assert_eq!(stats.deleted_outputs, 0);
        let kept = RobustMessage::decode(&store.get(2).unwrap().unwrap().data).unwrap();
        assert_eq!(kept.kind, RobustType::IrcFromClient);
        assert!(output.contains_input(2));
    }

    #[test]
    fn test_deterministic_given_same_now() {
        let run = |dir: &std::path::Path| -> Vec<u8> {
            let store = RedbLogStore::open(dir).unwrap();
            let output = OutputStream::open(dir).unwrap();
            put(&store, 1, RobustType::CreateSession, 0);
            put(&store, 2, RobustType::IrcFromClient, HOUR);
            put(&store, 3, RobustType::IrcFromClient, 2 * HOUR);
            compact(&store, &output, HOUR, 10 * HOUR).unwrap();
            compact(&store, &output, HOUR, 10 * HOUR).unwrap();
            store.contents_for_compare().unwrap()
        };
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_eq!(run(a.path()), run(b.path()));
    }
}
