//! The output stream: everything the network ever said to its clients.
//!
//! Each applied input record appends zero or more [`OutputRecord`]s, keyed by
//! their [`RobustId`]. Bridges long-poll with "give me the next record after
//! id X that interests session S"; `get_next` blocks on a notification until
//! an append, the deadline, or cancellation.
//!
//! Records are written through to a redb database under `<raftdir>/irclog`
//! so that a restarted node can keep answering polls for ids inside the
//! retention window without waiting for a snapshot. The in-memory ordered
//! map is the working set; redb is its durable mirror.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ircserver::SessionId;
use crate::types::RobustId;

/// Key is (id, reply), value is the JSON-encoded record.
const OUTPUT_TABLE: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("output");

/// One output line and the sessions that must observe it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub id: RobustId,
    /// The serialized IRC line, without CR-LF.
    pub line: String,
    /// Sessions this line is visible to.
    pub interested: BTreeSet<SessionId>,
}

pub struct OutputStream {
    inner: Mutex<StreamState>,
    /// Signalled on every append; each waiter re-checks against its own
    /// last-seen id.
    notify: Notify,
}

struct StreamState {
    records: BTreeMap<RobustId, OutputRecord>,
    db: Database,
}

impl OutputStream {
    /// Open (or create) the stream at `<dir>/irclog`, loading the retained
    /// records back into memory.
    pub fn open(dir: &Path) -> Result<OutputStream> {
        let db = Database::create(dir.join("irclog")).map_err(Error::storage)?;

        let mut records = BTreeMap::new();
        let read_txn = db.begin_read().map_err(Error::storage)?;
        match read_txn.open_table(OUTPUT_TABLE) {
            Ok(table) => {
                for entry in table.iter().map_err(Error::storage)? {
                    let (key, value) = entry.map_err(Error::storage)?;
                    let record: OutputRecord = serde_json::from_slice(value.value())
                        .map_err(|e| Error::StorageIo(e.to_string()))?;
                    let (id, reply) = key.value();
                    records.insert(RobustId { id, reply }, record);
                }
            }
            // First boot: the table does not exist yet.
            Err(redb::TableError::TableDoesNotExist(_)) => {}
            Err(e) => return Err(Error::storage(e)),
        }

        Ok(OutputStream {
            inner: Mutex::new(StreamState { records, db }),
            notify: Notify::new(),
        })
    }

    /// Append records produced by one applied input.
    ///
    /// Idempotent: a record whose id is already present is skipped, so
    /// re-applying a log entry after a restore produces no duplicates. Ids
    /// must otherwise be strictly increasing.
    pub fn append(&self, records: &[OutputRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock().expect("output stream lock poisoned");
            let fresh: Vec<&OutputRecord> = records
                .iter()
                .filter(|r| !inner.records.contains_key(&r.id))
                .collect();
            if fresh.is_empty() {
                return Ok(());
            }

            let write_txn = inner.db.begin_write().map_err(Error::storage)?;
            {
                let mut table = write_txn.open_table(OUTPUT_TABLE).map_err(Error::storage)?;
                for record in &fresh {
                    let value = serde_json::to_vec(record)
                        .map_err(|e| Error::StorageIo(e.to_string()))?;
                    table
                        .insert((record.id.id, record.id.reply), value.as_slice())
                        .map_err(Error::storage)?;
                }
            }
            write_txn.commit().map_err(Error::storage)?;

            for record in fresh {
                inner.records.insert(record.id, record.clone());
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return all lines for the next input id after `last_seen` that
    /// interest `session`, blocking until one is appended.
    ///
    /// Returns `Error::Timeout` when `deadline` passes and
    /// `Error::Cancelled` as soon as `cancel` fires.
    pub async fn get_next(
        &self,
        session: SessionId,
        last_seen: RobustId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(RobustId, Vec<String>)> {
        loop {
            // Arm the notification before checking, so an append between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = self.next_locked(session, last_seen) {
                return Ok(found);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    return Err(Error::Timeout);
                }
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    fn next_locked(&self, session: SessionId, last_seen: RobustId) -> Option<(RobustId, Vec<String>)> {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        let start = RobustId {
            id: last_seen.id,
            reply: last_seen.reply + 1,
        };
        let mut found_id: Option<u64> = None;
        let mut lines = Vec::new();
        for (id, record) in inner.records.range(start..) {
            if let Some(found) = found_id {
                if id.id != found {
                    break;
                }
            }
            if !record.interested.contains(&session) {
                continue;
            }
            found_id = Some(id.id);
            lines.push(record.line.clone());
        }
        found_id.map(|id| {
            // The position to resume from is the last reply of this batch.
            let last_reply = inner
                .records
                .range(RobustId { id, reply: 0 }..RobustId { id: id + 1, reply: 0 })
                .filter(|(_, r)| r.interested.contains(&session))
                .map(|(k, _)| k.reply)
                .last()
                .unwrap_or(0);
            (RobustId { id, reply: last_reply }, lines)
        })
    }

    /// The sessions interested in a given output id.
    pub fn interested_in(&self, id: RobustId) -> BTreeSet<SessionId> {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        inner
            .records
            .get(&id)
            .map(|r| r.interested.clone())
            .unwrap_or_default()
    }

    /// Drop every record with input id strictly below `id`, in memory and
    /// on disk.
    pub fn delete_before(&self, id: u64) -> Result<usize> {
        let mut inner = self.inner.lock().expect("output stream lock poisoned");
        let cutoff = RobustId { id, reply: 0 };
        let doomed: Vec<RobustId> = inner.records.range(..cutoff).map(|(k, _)| *k).collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let write_txn = inner.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = write_txn.open_table(OUTPUT_TABLE).map_err(Error::storage)?;
            for key in &doomed {
                table.remove((key.id, key.reply)).map_err(Error::storage)?;
            }
        }
        write_txn.commit().map_err(Error::storage)?;

        for key in &doomed {
            inner.records.remove(key);
        }
        Ok(doomed.len())
    }

    /// Smallest retained input id, if any.
    pub fn first_id(&self) -> Option<u64> {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        inner.records.keys().next().map(|k| k.id)
    }

    /// Largest retained output id, if any.
    pub fn last_id(&self) -> Option<RobustId> {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        inner.records.keys().next_back().copied()
    }

    /// Whether any output of input id `id` is still retained.
    pub fn contains_input(&self, id: u64) -> bool {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        inner
            .records
            .range(RobustId { id, reply: 0 }..RobustId { id: id + 1, reply: 0 })
            .next()
            .is_some()
    }

    /// A copy of every retained record, in id order. Used by snapshots.
    pub fn tail(&self) -> Vec<OutputRecord> {
        let inner = self.inner.lock().expect("output stream lock poisoned");
        inner.records.values().cloned().collect()
    }

    /// Replace the stream contents from a snapshot.
    pub fn restore(&self, records: Vec<OutputRecord>) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("output stream lock poisoned");
            let write_txn = inner.db.begin_write().map_err(Error::storage)?;
            {
                let mut table = write_txn.open_table(OUTPUT_TABLE).map_err(Error::storage)?;
                let old: Vec<(u64, u64)> = inner.records.keys().map(|k| (k.id, k.reply)).collect();
                for key in old {
                    table.remove(key).map_err(Error::storage)?;
                }
                for record in &records {
                    let value = serde_json::to_vec(record)
                        .map_err(|e| Error::StorageIo(e.to_string()))?;
                    table
                        .insert((record.id.id, record.id.reply), value.as_slice())
                        .map_err(Error::storage)?;
                }
            }
            write_txn.commit().map_err(Error::storage)?;

            inner.records = records.into_iter().map(|r| (r.id, r)).collect();
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
