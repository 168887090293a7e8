//! Snapshots: serialized IRC state plus the retained output tail.
//!
//! Snapshot bytes are deterministic: the state uses only ordered maps and
//! the records are sorted by id, so two nodes with the same applied log
//! produce identical files. At most five snapshots are kept on disk under
//! `<raftdir>/snapshots/`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ircserver::IrcServer;
use crate::outputstream::OutputRecord;

/// How many snapshots to retain on disk.
const RETAIN: usize = 5;

/// A complete, restorable copy of node state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub server: IrcServer,
    pub output: Vec<OutputRecord>,
}

impl SnapshotData {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot serialization is infallible")
    }

    pub fn decode<R: Read>(reader: R) -> Result<SnapshotData> {
        serde_json::from_reader(reader).map_err(|e| Error::SnapshotCorrupt(e.to_string()))
    }
}

/// Snapshot files under `<raftdir>/snapshots/`, newest-index wins.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open(raft_dir: &Path) -> Result<FileSnapshotStore> {
        let dir = raft_dir.join("snapshots");
        fs::create_dir_all(&dir)?;
        Ok(FileSnapshotStore { dir })
    }

    fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{:020}.json", index))
    }

    /// Persist a snapshot taken at `index`, pruning old ones beyond the
    /// retention count. The write goes through a temporary file so a crash
    /// never leaves a half-written snapshot behind.
    pub fn save(&self, index: u64, snapshot: &SnapshotData) -> Result<PathBuf> {
        let path = self.path_for(index);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, snapshot.encode())?;
        fs::rename(&tmp, &path)?;
        self.prune()?;
        Ok(path)
    }

    /// The newest snapshot, if any.
    pub fn latest(&self) -> Result<Option<(u64, SnapshotData)>> {
        let mut indices = self.indices()?;
        let index = match indices.pop() {
            Some(index) => index,
            None => return Ok(None),
        };
        let file = fs::File::open(self.path_for(index))?;
        Ok(Some((index, SnapshotData::decode(file)?)))
    }

    fn indices(&self) -> Result<Vec<u64>> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = name
                .strip_prefix("snapshot-")
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn prune(&self) -> Result<()> {
        let indices = self.indices()?;
        if indices.len() > RETAIN {
            for index in &indices[..indices.len() - RETAIN] {
                fs::remove_file(self.path_for(*index))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(n: u64) -> SnapshotData {
        let mut server = IrcServer::new("robustirc.net");
        server.server_created = n as i64;
        SnapshotData {
            server,
            output: Vec::new(),
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = snapshot(1);
        assert_eq!(a.encode(), a.encode());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SnapshotData::decode(&b"nope"[..]),
            Err(Error::SnapshotCorrupt(_))
        ));
    }

    #[test]
    fn test_save_latest_prune() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSnapshotStore::open(dir.path()).expect("open");
        for i in 1..=7u64 {
            store.save(i, &snapshot(i)).expect("save");
        }
        let (index, data) = store.latest().expect("latest").expect("some");
        assert_eq!(index, 7);
        assert_eq!(data.server.server_created, 7);
        // Only the five newest remain.
        assert_eq!(store.indices().unwrap(), vec![3, 4, 5, 6, 7]);
    }
}
