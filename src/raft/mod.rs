//! The consensus seam.
//!
//! The raft library itself is an external collaborator; this module pins
//! down the two contracts the rest of the node is written against:
//!
//! - [`Consensus`]: propose a record, observe the node state, manage peers.
//! - The FSM side, [`fsm::RobustFsm`]: applied in committed-index order, in
//!   one serialized context, on every node.
//!
//! [`LocalNode`] is the conforming single-node implementation used for
//! bootstrapping the first node of a network and by the integration tests;
//! a multi-node transport plugs into the same traits.

pub mod compaction;
pub mod fsm;
pub mod snapshot;
pub mod storage;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::RobustId;

pub use fsm::RobustFsm;
pub use snapshot::{FileSnapshotStore, SnapshotData};
pub use storage::RedbLogStore;

/// Raft role of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Leader,
    Follower,
    Candidate,
    /// The node was removed from the network; the process must terminate.
    Shutdown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeState::Leader => "leader",
            NodeState::Follower => "follower",
            NodeState::Candidate => "candidate",
            NodeState::Shutdown => "shutdown",
        };
        write!(f, "{}", label)
    }
}

/// One committed log entry, as handed to the FSM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub data: Vec<u8>,
}

/// The operations the node needs from a raft implementation.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Propose a record and wait until it is committed and applied, or the
    /// wait window closes with [`Error::Timeout`].
    async fn apply(&self, data: Vec<u8>, timeout: Duration) -> Result<RobustId>;

    /// Current role of this node.
    fn state(&self) -> NodeState;

    /// host:port of the current leader, if known.
    fn leader(&self) -> Option<String>;

    /// Add a peer to the cluster. Leader only.
    async fn add_peer(&self, addr: String) -> Result<()>;
}

/// Single-node consensus: this node is always the leader and every proposal
/// commits immediately, in proposal order.
pub struct LocalNode {
    fsm: Arc<RobustFsm>,
    store: Arc<RedbLogStore>,
    next_index: AtomicU64,
    peer_addr: String,
    peers: Mutex<Vec<String>>,
    peers_path: PathBuf,
}

impl LocalNode {
    pub fn new(
        fsm: Arc<RobustFsm>,
        store: Arc<RedbLogStore>,
        raft_dir: &std::path::Path,
        peer_addr: String,
    ) -> Result<LocalNode> {
        // Indices continue after whatever the log or a restored snapshot
        // has already claimed.
        let next_index = store
            .last_index()?
            .unwrap_or(0)
            .max(fsm.last_applied())
            + 1;
        let peers_path = raft_dir.join("peers.json");
        let peers = match fs::read(&peers_path) {
            Ok(data) => serde_json::from_slice(&data)
                .map_err(|e| Error::StorageIo(format!("peers.json: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![peer_addr.clone()],
            Err(e) => return Err(e.into()),
        };
        Ok(LocalNode {
            fsm,
            store,
            next_index: AtomicU64::new(next_index),
            peer_addr,
            peers: Mutex::new(peers),
            peers_path,
        })
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().expect("peers lock poisoned").clone()
    }

    fn persist_peers(&self, peers: &[String]) -> Result<()> {
        let data = serde_json::to_vec(peers).map_err(|e| Error::StorageIo(e.to_string()))?;
        fs::write(&self.peers_path, data)?;
        Ok(())
    }
}

#[async_trait]
impl Consensus for LocalNode {
    async fn apply(&self, data: Vec<u8>, _timeout: Duration) -> Result<RobustId> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let entry = LogEntry { index, data };
        self.store.append(&entry)?;
        self.fsm.apply(&entry)?;
        Ok(RobustId::new(index, 0))
    }

    fn state(&self) -> NodeState {
        NodeState::Leader
    }

    fn leader(&self) -> Option<String> {
        Some(self.peer_addr.clone())
    }

    async fn add_peer(&self, addr: String) -> Result<()> {
        let mut peers = self.peers.lock().expect("peers lock poisoned");
        if !peers.contains(&addr) {
            peers.push(addr);
            self.persist_peers(&peers)?;
        }
        Ok(())
    }
}
