//! Persistent log storage over redb.
//!
//! The committed log lives in `<raftdir>/raftlog`, one table keyed by index.
//! Entries are only ever appended or rewritten in place by compaction.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};
use crate::raft::LogEntry;

const ENTRIES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("entries");

pub struct RedbLogStore {
    db: Database,
}

impl RedbLogStore {
    /// Open (or create) the log at `<dir>/raftlog`.
    pub fn open(dir: &Path) -> Result<RedbLogStore> {
        let db = Database::create(dir.join("raftlog")).map_err(Error::storage)?;
        // Ensure the table exists so readers never race its creation.
        let write_txn = db.begin_write().map_err(Error::storage)?;
        write_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
        write_txn.commit().map_err(Error::storage)?;
        Ok(RedbLogStore { db })
    }

    pub fn first_index(&self) -> Result<Option<u64>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
        let first = table.first().map_err(Error::storage)?;
        Ok(first.map(|(key, _)| key.value()))
    }

    pub fn last_index(&self) -> Result<Option<u64>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
        let last = table.last().map_err(Error::storage)?;
        Ok(last.map(|(key, _)| key.value()))
    }

    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
        let entry = table.get(index).map_err(Error::storage)?;
        Ok(entry.map(|value| LogEntry {
            index,
            data: value.value().to_vec(),
        }))
    }

    /// Append one committed entry.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(Error::storage)?;
        {
            let mut table = write_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
            table
                .insert(entry.index, entry.data.as_slice())
                .map_err(Error::storage)?;
        }
        write_txn.commit().map_err(Error::storage)?;
        Ok(())
    }

    /// Rewrite the payload of an existing entry. Used by compaction to fold
    /// an entry into its placeholder form.
    pub fn replace(&self, index: u64, data: &[u8]) -> Result<()> {
        self.append(&LogEntry {
            index,
            data: data.to_vec(),
        })
    }

    /// All entries in index order.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let read_txn = self.db.begin_read().map_err(Error::storage)?;
        let table = read_txn.open_table(ENTRIES_TABLE).map_err(Error::storage)?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(Error::storage)? {
            let (key, value) = entry.map_err(Error::storage)?;
            entries.push(LogEntry {
                index: key.value(),
                data: value.value().to_vec(),
            });
        }
        Ok(entries)
    }

    /// Concatenated entry payloads, for byte-comparing two logs.
    pub fn contents_for_compare(&self) -> Result<Vec<u8>> {
        let mut all = Vec::new();
        for entry in self.entries()? {
            all.extend_from_slice(&entry.index.to_be_bytes());
            all.extend_from_slice(&entry.data);
        }
        Ok(all)
    }
}
